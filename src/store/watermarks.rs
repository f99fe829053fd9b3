use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::Result;
use crate::types::SyncWatermark;

/// Per-peer catch-up floor, persisted as one small JSON document.
pub struct WatermarkTable {
    path: PathBuf,
    marks: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl WatermarkTable {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("watermarks.json");

        let marks = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(marks) => marks,
                    Err(e) => {
                        tracing::warn!(
                            "[STORE watermarks] failed to parse {:?}: {}, starting from the beginning",
                            path,
                            e
                        );
                        BTreeMap::new()
                    }
                },
                Err(e) => return Err(e.into()),
            }
        } else {
            BTreeMap::new()
        };

        Ok(WatermarkTable {
            path,
            marks: Mutex::new(marks),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DateTime<Utc>>> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` means the peer has never been pulled from.
    pub fn get(&self, peer_id: &str) -> Option<DateTime<Utc>> {
        self.lock().get(peer_id).copied()
    }

    /// Move the watermark forward to `ts`. Never moves it backward.
    pub fn advance(&self, peer_id: &str, ts: DateTime<Utc>) -> Result<bool> {
        let mut marks = self.lock();
        if marks.get(peer_id).is_some_and(|current| *current >= ts) {
            return Ok(false);
        }

        let mut next = marks.clone();
        next.insert(peer_id.to_string(), ts);
        self.persist(&next)?;
        *marks = next;
        Ok(true)
    }

    fn persist(&self, marks: &BTreeMap<String, DateTime<Utc>>) -> Result<()> {
        let json = serde_json::to_string_pretty(marks)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn all(&self) -> Vec<SyncWatermark> {
        self.lock()
            .iter()
            .map(|(peer_id, ts)| SyncWatermark {
                peer_id: peer_id.clone(),
                last_synced_at: *ts,
            })
            .collect()
    }
}
