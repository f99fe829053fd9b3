//! Durable local state of a node.
//!
//! Four tables share one directory (`{data_dir}/store`): the message log, the
//! per-(message, peer) sync records, the offline queue, and the per-peer
//! catch-up watermarks. The first three are JSONL journals replayed into
//! memory on open; watermarks are a single JSON document.

pub mod journal;
pub mod messages;
pub mod offline_queue;
pub mod sync_records;
pub mod watermarks;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;

pub use messages::{ApplyOutcome, MessageLog};
pub use offline_queue::OfflineQueueTable;
pub use sync_records::SyncRecordTable;
pub use watermarks::WatermarkTable;

pub struct Store {
    dir: PathBuf,
    messages: MessageLog,
    sync_records: SyncRecordTable,
    offline_queue: OfflineQueueTable,
    watermarks: WatermarkTable,
}

impl Store {
    /// Open every table under `{data_dir}/store`, creating it if needed.
    pub fn open(data_dir: &Path, node_id: &str) -> Result<Arc<Self>> {
        let dir = data_dir.join("store");
        std::fs::create_dir_all(&dir)?;

        let store = Store {
            messages: MessageLog::open(&dir, node_id)?,
            sync_records: SyncRecordTable::open(&dir)?,
            offline_queue: OfflineQueueTable::open(&dir)?,
            watermarks: WatermarkTable::open(&dir)?,
            dir,
        };
        Ok(Arc::new(store))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn node_id(&self) -> &str {
        self.messages.node_id()
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    pub fn sync_records(&self) -> &SyncRecordTable {
        &self.sync_records
    }

    pub fn offline_queue(&self) -> &OfflineQueueTable {
        &self.offline_queue
    }

    pub fn watermarks(&self) -> &WatermarkTable {
        &self.watermarks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_store_dir() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path(), "node-a").unwrap();

        assert!(tmp.path().join("store").is_dir());
        assert_eq!(store.node_id(), "node-a");
        assert_eq!(store.messages().count(), 0);
        assert!(store.offline_queue().is_empty());
        assert!(store.sync_records().is_empty());
    }

    #[test]
    fn test_tables_reopen_together() {
        let tmp = TempDir::new().unwrap();
        {
            let store = Store::open(tmp.path(), "node-a").unwrap();
            let m = store.messages().insert_local("alice", "hi").unwrap();
            store
                .offline_queue()
                .enqueue("node-b", m.local_id, m.snapshot())
                .unwrap();
        }

        let store = Store::open(tmp.path(), "node-a").unwrap();
        assert_eq!(store.messages().count(), 1);
        let entry = store.offline_queue().front("node-b").unwrap();
        assert_eq!(entry.message_snapshot.origin(), Some(("node-a", 1)));
    }
}
