use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::Result;

const SEGMENT_MAX_BYTES: u64 = 10 * 1024 * 1024;

struct ActiveSegment {
    writer: BufWriter<File>,
    path: PathBuf,
    size: u64,
    id: u32,
}

/// Append-only JSONL journal split into `{table}_{NNNN}.jsonl` segments.
///
/// Every table of the store is an in-memory view rebuilt from its journal on
/// open. Lines that fail to parse (a torn write at crash time) are skipped, and
/// an unterminated tail of the active segment is cut off before appending.
pub struct Journal<T> {
    dir: PathBuf,
    table: String,
    segment: Mutex<ActiveSegment>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Journal<T> {
    /// Open (or create) the journal and replay every record in write order.
    pub fn open(dir: &Path, table: &str) -> Result<(Self, Vec<T>)> {
        fs::create_dir_all(dir)?;

        let segments = Self::segment_files(dir, table)?;
        let mut records = Vec::new();
        for (_, path) in &segments {
            Self::read_segment(path, &mut records)?;
        }

        let next_seg_id = segments.last().map(|(id, _)| *id).unwrap_or(1);
        let seg_path = Self::segment_path(dir, table, next_seg_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&seg_path)?;
        let seg_size = Self::repair_tail(&seg_path, &mut file)?;

        tracing::debug!(
            "[STORE {}] replayed {} records from {} segments",
            table,
            records.len(),
            segments.len()
        );

        let journal = Journal {
            dir: dir.to_path_buf(),
            table: table.to_string(),
            segment: Mutex::new(ActiveSegment {
                writer: BufWriter::new(file),
                path: seg_path,
                size: seg_size,
                id: next_seg_id,
            }),
            _record: PhantomData,
        };
        Ok((journal, records))
    }

    fn segment_path(dir: &Path, table: &str, id: u32) -> PathBuf {
        dir.join(format!("{}_{:04}.jsonl", table, id))
    }

    fn segment_files(dir: &Path, table: &str) -> Result<Vec<(u32, PathBuf)>> {
        let prefix = format!("{}_", table);
        let mut segments: Vec<(u32, PathBuf)> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_str()?.to_string();
                let id = name
                    .strip_prefix(&prefix)
                    .and_then(|s| s.strip_suffix(".jsonl"))
                    .and_then(|s| s.parse::<u32>().ok())?;
                Some((id, e.path()))
            })
            .collect();
        segments.sort_by_key(|(id, _)| *id);
        Ok(segments)
    }

    /// Make sure the next append starts on a fresh line. A complete record
    /// missing only its newline is terminated; anything else after the last
    /// newline is cut off. Returns the resulting length.
    fn repair_tail(path: &Path, file: &mut File) -> Result<u64> {
        let bytes = fs::read(path)?;
        let keep = match bytes.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };
        if keep == bytes.len() {
            return Ok(keep as u64);
        }

        if serde_json::from_slice::<T>(&bytes[keep..]).is_ok() {
            file.write_all(b"\n")?;
            return Ok(bytes.len() as u64 + 1);
        }
        tracing::warn!(
            "truncating {} bytes of unterminated record at the end of {:?}",
            bytes.len() - keep,
            path
        );
        file.set_len(keep as u64)?;
        Ok(keep as u64)
    }

    fn read_segment(path: &Path, out: &mut Vec<T>) -> Result<()> {
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => out.push(record),
                Err(e) => {
                    tracing::warn!("skipping unreadable journal line in {:?}: {}", path, e);
                }
            }
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ActiveSegment> {
        self.segment.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one record. A failed write is rolled back to the previous
    /// length so no partial line is left in front of the next record.
    pub fn append(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut seg = self.lock();
        if let Err(e) = write_line(&mut seg.writer, &line) {
            if let Err(rollback) = Self::rollback_locked(&mut seg) {
                tracing::error!(
                    "failed to roll back {:?} after write error: {}",
                    seg.path,
                    rollback
                );
            }
            return Err(e.into());
        }
        seg.size += line.len() as u64;

        if seg.size >= SEGMENT_MAX_BYTES {
            self.rotate_segment_locked(&mut seg)?;
        }
        Ok(())
    }

    /// Drop whatever the writer still buffers and cut the file back to the
    /// last fully written record.
    fn rollback_locked(seg: &mut ActiveSegment) -> Result<()> {
        let file = OpenOptions::new().append(true).open(&seg.path)?;
        file.set_len(seg.size)?;
        let stale = std::mem::replace(&mut seg.writer, BufWriter::new(file));
        // into_parts hands back the buffer without flushing it
        let _ = stale.into_parts();
        Ok(())
    }

    fn rotate_segment_locked(&self, seg: &mut ActiveSegment) -> Result<()> {
        seg.writer.flush()?;
        seg.id += 1;
        let new_path = Self::segment_path(&self.dir, &self.table, seg.id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&new_path)?;
        seg.writer = BufWriter::new(file);
        seg.path = new_path;
        seg.size = 0;
        Ok(())
    }

    /// Rewrite the journal as exactly `live`, returning how many old segments were dropped.
    ///
    /// The live records go into a fresh segment first and older segments are
    /// deleted afterwards, so a crash in between replays the old history
    /// followed by the live set.
    pub fn compact(&self, live: &[T]) -> Result<usize> {
        let mut seg = self.lock();
        seg.writer.flush()?;

        let new_id = seg.id + 1;
        let new_path = Self::segment_path(&self.dir, &self.table, new_id);
        let mut size = 0u64;
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&new_path)?;
            let mut writer = BufWriter::new(file);
            for record in live {
                let line = serde_json::to_string(record)?;
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
                size += line.len() as u64 + 1;
            }
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }

        let file = OpenOptions::new().append(true).open(&new_path)?;
        seg.writer = BufWriter::new(file);
        seg.path = new_path;
        seg.size = size;
        seg.id = new_id;

        let mut removed = 0;
        for (id, path) in Self::segment_files(&self.dir, &self.table)? {
            if id < new_id {
                fs::remove_file(path)?;
                removed += 1;
            }
        }

        tracing::debug!(
            "[STORE {}] compacted to {} records, removed {} segments",
            self.table,
            live.len(),
            removed
        );
        Ok(removed)
    }
}

fn write_line(writer: &mut BufWriter<File>, line: &[u8]) -> io::Result<()> {
    writer.write_all(line)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        n: u32,
    }

    #[test]
    fn test_append_and_replay() {
        let tmp = TempDir::new().unwrap();
        {
            let (journal, replayed) = Journal::<Row>::open(tmp.path(), "rows").unwrap();
            assert!(replayed.is_empty());
            journal.append(&Row { n: 1 }).unwrap();
            journal.append(&Row { n: 2 }).unwrap();
        }

        let (_journal, replayed) = Journal::<Row>::open(tmp.path(), "rows").unwrap();
        assert_eq!(replayed, vec![Row { n: 1 }, Row { n: 2 }]);
    }

    #[test]
    fn test_tables_do_not_share_segments() {
        let tmp = TempDir::new().unwrap();
        let (a, _) = Journal::<Row>::open(tmp.path(), "alpha").unwrap();
        let (b, _) = Journal::<Row>::open(tmp.path(), "alpha_beta").unwrap();
        a.append(&Row { n: 1 }).unwrap();
        b.append(&Row { n: 2 }).unwrap();
        drop((a, b));

        let (_, alpha) = Journal::<Row>::open(tmp.path(), "alpha").unwrap();
        assert_eq!(alpha, vec![Row { n: 1 }]);
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let tmp = TempDir::new().unwrap();
        {
            let (journal, _) = Journal::<Row>::open(tmp.path(), "rows").unwrap();
            journal.append(&Row { n: 1 }).unwrap();
        }
        let seg = tmp.path().join("rows_0001.jsonl");
        let mut f = OpenOptions::new().append(true).open(&seg).unwrap();
        f.write_all(b"{\"n\": 2").unwrap();
        drop(f);

        let (_, replayed) = Journal::<Row>::open(tmp.path(), "rows").unwrap();
        assert_eq!(replayed, vec![Row { n: 1 }]);
    }

    #[test]
    fn test_append_after_torn_line_survives_replay() {
        let tmp = TempDir::new().unwrap();
        {
            let (journal, _) = Journal::<Row>::open(tmp.path(), "rows").unwrap();
            journal.append(&Row { n: 1 }).unwrap();
        }
        let seg = tmp.path().join("rows_0001.jsonl");
        let mut f = OpenOptions::new().append(true).open(&seg).unwrap();
        f.write_all(b"{\"n\": 2").unwrap();
        drop(f);

        {
            let (journal, replayed) = Journal::<Row>::open(tmp.path(), "rows").unwrap();
            assert_eq!(replayed, vec![Row { n: 1 }]);
            journal.append(&Row { n: 3 }).unwrap();
        }

        let (_, replayed) = Journal::<Row>::open(tmp.path(), "rows").unwrap();
        assert_eq!(replayed, vec![Row { n: 1 }, Row { n: 3 }]);
        assert_eq!(fs::read_to_string(&seg).unwrap(), "{\"n\":1}\n{\"n\":3}\n");
    }

    #[test]
    fn test_unterminated_complete_record_is_kept() {
        let tmp = TempDir::new().unwrap();
        let seg = tmp.path().join("rows_0001.jsonl");
        fs::write(&seg, "{\"n\":1}\n{\"n\":2}").unwrap();

        {
            let (journal, replayed) = Journal::<Row>::open(tmp.path(), "rows").unwrap();
            assert_eq!(replayed, vec![Row { n: 1 }, Row { n: 2 }]);
            journal.append(&Row { n: 3 }).unwrap();
        }

        let (_, replayed) = Journal::<Row>::open(tmp.path(), "rows").unwrap();
        assert_eq!(replayed, vec![Row { n: 1 }, Row { n: 2 }, Row { n: 3 }]);
    }

    #[test]
    fn test_rollback_cuts_partial_write() {
        let tmp = TempDir::new().unwrap();
        let (journal, _) = Journal::<Row>::open(tmp.path(), "rows").unwrap();
        journal.append(&Row { n: 1 }).unwrap();

        let seg = tmp.path().join("rows_0001.jsonl");
        let mut f = OpenOptions::new().append(true).open(&seg).unwrap();
        f.write_all(b"{\"n\":").unwrap();
        drop(f);

        Journal::<Row>::rollback_locked(&mut journal.lock()).unwrap();
        journal.append(&Row { n: 2 }).unwrap();
        drop(journal);

        let (_, replayed) = Journal::<Row>::open(tmp.path(), "rows").unwrap();
        assert_eq!(replayed, vec![Row { n: 1 }, Row { n: 2 }]);
    }

    #[test]
    fn test_compact_replaces_history() {
        let tmp = TempDir::new().unwrap();
        {
            let (journal, _) = Journal::<Row>::open(tmp.path(), "rows").unwrap();
            for n in 0..10 {
                journal.append(&Row { n }).unwrap();
            }
            journal
                .rotate_segment_locked(&mut journal.lock())
                .unwrap();
            journal.append(&Row { n: 10 }).unwrap();

            let removed = journal.compact(&[Row { n: 3 }, Row { n: 10 }]).unwrap();
            assert_eq!(removed, 2);
            journal.append(&Row { n: 11 }).unwrap();
        }

        let (_, replayed) = Journal::<Row>::open(tmp.path(), "rows").unwrap();
        assert_eq!(replayed, vec![Row { n: 3 }, Row { n: 10 }, Row { n: 11 }]);
    }
}
