use std::sync::Arc;
use syncboard_replication::ReplicationManager;

pub mod health;
pub mod messages;
pub mod status;
pub mod sync;

pub struct AppState {
    pub replication: Arc<ReplicationManager>,
}

pub use health::health;
pub use messages::{create_message, list_messages};
pub use status::sync_status;
pub use sync::sync_message;
