use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::journal::Journal;
use crate::error::Result;
use crate::types::SyncRecord;

/// Journal lines tolerated per live row before the table is rewritten.
const COMPACT_RATIO: usize = 2;
const COMPACT_MIN_LINES: usize = 1024;

struct RecordState {
    rows: HashMap<(u64, String), SyncRecord>,
    journal_lines: usize,
}

/// One current delivery record per `(message_id, peer_id)`; each upsert replaces it.
pub struct SyncRecordTable {
    journal: Journal<SyncRecord>,
    state: Mutex<RecordState>,
}

impl SyncRecordTable {
    pub fn open(dir: &Path) -> Result<Self> {
        let (journal, history) = Journal::<SyncRecord>::open(dir, "sync_records")?;
        let journal_lines = history.len();

        let mut rows = HashMap::new();
        for record in history {
            rows.insert((record.message_id, record.peer_id.clone()), record);
        }

        let table = SyncRecordTable {
            journal,
            state: Mutex::new(RecordState {
                rows,
                journal_lines,
            }),
        };
        {
            let mut state = table.lock();
            table.maybe_compact(&mut state)?;
        }
        Ok(table)
    }

    fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn maybe_compact(&self, state: &mut RecordState) -> Result<()> {
        let live = state.rows.len();
        if state.journal_lines < COMPACT_MIN_LINES || state.journal_lines <= live * COMPACT_RATIO {
            return Ok(());
        }
        let mut rows: Vec<SyncRecord> = state.rows.values().cloned().collect();
        rows.sort_by(|a, b| a.last_attempt_at.cmp(&b.last_attempt_at));
        self.journal.compact(&rows)?;
        state.journal_lines = rows.len();
        Ok(())
    }

    pub fn upsert(&self, record: SyncRecord) -> Result<()> {
        let mut state = self.lock();
        self.journal.append(&record)?;
        state.journal_lines += 1;
        state
            .rows
            .insert((record.message_id, record.peer_id.clone()), record);
        self.maybe_compact(&mut state)
    }

    pub fn get(&self, message_id: u64, peer_id: &str) -> Option<SyncRecord> {
        self.lock()
            .rows
            .get(&(message_id, peer_id.to_string()))
            .cloned()
    }

    pub fn for_message(&self, message_id: u64) -> Vec<SyncRecord> {
        let mut records: Vec<SyncRecord> = self
            .lock()
            .rows
            .values()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        records
    }

    /// Records whose last attempt happened at or after `since`.
    pub fn recent(&self, since: DateTime<Utc>) -> Vec<SyncRecord> {
        let mut records: Vec<SyncRecord> = self
            .lock()
            .rows
            .values()
            .filter(|r| r.last_attempt_at >= since)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.last_attempt_at.cmp(&b.last_attempt_at));
        records
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeliveryStatus;
    use tempfile::TempDir;

    fn record(message_id: u64, peer: &str, status: DeliveryStatus, attempts: u32) -> SyncRecord {
        SyncRecord {
            message_id,
            peer_id: peer.to_string(),
            status,
            attempts,
            last_attempt_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_replaces_current_record() {
        let tmp = TempDir::new().unwrap();
        let table = SyncRecordTable::open(tmp.path()).unwrap();

        table
            .upsert(record(1, "s1", DeliveryStatus::Pending, 1))
            .unwrap();
        table
            .upsert(record(1, "s1", DeliveryStatus::Success, 2))
            .unwrap();
        table
            .upsert(record(1, "s2", DeliveryStatus::Failed, 3))
            .unwrap();

        assert_eq!(table.len(), 2);
        let current = table.get(1, "s1").unwrap();
        assert_eq!(current.status, DeliveryStatus::Success);
        assert_eq!(current.attempts, 2);

        let peers: Vec<String> = table.for_message(1).into_iter().map(|r| r.peer_id).collect();
        assert_eq!(peers, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn test_reopen_keeps_last_record_and_compacts() {
        let tmp = TempDir::new().unwrap();
        {
            let table = SyncRecordTable::open(tmp.path()).unwrap();
            for attempt in 1..=(COMPACT_MIN_LINES as u32 + 10) {
                table
                    .upsert(record(5, "m", DeliveryStatus::Pending, attempt))
                    .unwrap();
            }
        }

        let table = SyncRecordTable::open(tmp.path()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get(5, "m").unwrap().attempts,
            COMPACT_MIN_LINES as u32 + 10
        );
        assert!(table.lock().journal_lines < COMPACT_MIN_LINES);
    }

    #[test]
    fn test_recent_filters_by_attempt_time() {
        let tmp = TempDir::new().unwrap();
        let table = SyncRecordTable::open(tmp.path()).unwrap();

        let mut old = record(1, "s1", DeliveryStatus::Failed, 3);
        old.last_attempt_at = Utc::now() - chrono::Duration::hours(2);
        table.upsert(old).unwrap();
        table
            .upsert(record(2, "s1", DeliveryStatus::Success, 1))
            .unwrap();

        let recent = table.recent(Utc::now() - chrono::Duration::hours(1));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message_id, 2);
    }
}
