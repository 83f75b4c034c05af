//! Append-only write-ahead log.
//!
//! TigerStyle: one lock covers sequence assignment, write, flush, and
//! rotation, so the on-disk state and `seq_no` can never diverge.
//!
//! One record per newline-terminated line:
//!
//! ```text
//! <seq_no>|<timestamp_ms>|<actor_id>|<key>|<value>
//! ```
//!
//! The value field is the tail of the line and may itself contain `|`.
//! Rotation keeps exactly one predecessor file at `<path>.1`.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use nixie_core::constants::WAL_FILE_SIZE_BYTES_MAX;
use nixie_core::{now_ms, Error, Result};

/// A single WAL record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Monotone sequence number, unique within one file lineage
    pub seq_no: u64,
    /// Wall-clock stamp in milliseconds
    pub timestamp_ms: u64,
    /// Owning actor
    pub actor_id: String,
    /// Key within the actor's namespace
    pub key: String,
    /// Raw value bytes as written
    pub value: String,
}

impl WalRecord {
    fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}\n",
            self.seq_no, self.timestamp_ms, self.actor_id, self.key, self.value
        )
    }

    fn decode(line: &str) -> Option<Self> {
        let mut parts = line.splitn(5, '|');
        let seq_no = parts.next()?.parse().ok()?;
        let timestamp_ms = parts.next()?.parse().ok()?;
        let actor_id = parts.next()?.to_string();
        let key = parts.next()?.to_string();
        let value = parts.next()?.to_string();
        if actor_id.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self {
            seq_no,
            timestamp_ms,
            actor_id,
            key,
            value,
        })
    }
}

/// Counters from a replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records handed to the handler
    pub replayed: u64,
    /// Corrupt or short lines skipped
    pub skipped: u64,
}

/// Observer invoked synchronously, under the WAL lock, for every append
pub type EntryHandler = Box<dyn Fn(&WalRecord) + Send + Sync>;

struct WalInner {
    file: File,
    size_bytes: u64,
    next_seq: u64,
}

/// Append-only, rotating write-ahead log
pub struct Wal {
    path: PathBuf,
    max_size_bytes: u64,
    inner: Mutex<WalInner>,
    entry_handler: RwLock<Option<EntryHandler>>,
}

impl Wal {
    /// Open (or create) the log at `path` with the default rotation threshold.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_max_size(path, WAL_FILE_SIZE_BYTES_MAX)
    }

    /// Open (or create) the log with an explicit rotation threshold.
    ///
    /// The existing file is scanned so the sequence resumes after the
    /// highest record already on disk, keeping the lineage monotone across
    /// restarts.
    pub fn open_with_max_size(path: impl AsRef<Path>, max_size_bytes: u64) -> Result<Self> {
        debug_assert!(max_size_bytes > 0);
        let path = path.as_ref().to_path_buf();

        let (last_seq, skipped) = scan_last_seq(&path)?;
        if skipped > 0 {
            warn!(path = %path.display(), skipped, "wal contains unreadable lines");
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::WalOpenFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let size_bytes = file
            .metadata()
            .map_err(|e| Error::WalOpenFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
            .len();

        debug!(path = %path.display(), last_seq, size_bytes, "wal opened");

        Ok(Self {
            path,
            max_size_bytes,
            inner: Mutex::new(WalInner {
                file,
                size_bytes,
                next_seq: last_seq + 1,
            }),
            entry_handler: RwLock::new(None),
        })
    }

    /// Register the handler observing every appended record.
    pub fn set_entry_handler(&self, handler: impl Fn(&WalRecord) + Send + Sync + 'static) {
        *self.entry_handler.write() = Some(Box::new(handler));
    }

    /// Remove the entry handler.
    pub fn clear_entry_handler(&self) {
        *self.entry_handler.write() = None;
    }

    /// Append one record: assign the next sequence number, stamp it, write,
    /// flush, rotate if the file crossed the threshold, then hand the record
    /// to the entry handler. Returns the assigned sequence number.
    ///
    /// The value must not contain newlines (the store rejects them at its
    /// write boundary); a newline here would split the record on replay.
    pub fn append(&self, actor_id: &str, key: &str, value: &str) -> Result<u64> {
        debug_assert!(
            !value.contains(['\n', '\r']),
            "value must not contain newlines"
        );
        let mut inner = self.inner.lock();

        let record = WalRecord {
            seq_no: inner.next_seq,
            timestamp_ms: now_ms(),
            actor_id: actor_id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        };
        let line = record.encode();

        inner
            .file
            .write_all(line.as_bytes())
            .map_err(|e| Error::wal_append(e.to_string()))?;
        inner
            .file
            .flush()
            .map_err(|e| Error::wal_append(e.to_string()))?;

        inner.next_seq += 1;
        inner.size_bytes += line.len() as u64;

        if inner.size_bytes >= self.max_size_bytes {
            self.rotate_locked(&mut inner)?;
        }

        if let Some(handler) = self.entry_handler.read().as_ref() {
            handler(&record);
        }

        Ok(record.seq_no)
    }

    /// Close the current file, rename it to `<path>.1` (replacing any older
    /// rotation), and start a fresh file. The sequence continues.
    fn rotate_locked(&self, inner: &mut WalInner) -> Result<()> {
        let rotated = rotated_path(&self.path);

        std::fs::rename(&self.path, &rotated).map_err(|e| Error::WalRotateFailed {
            reason: format!("rename to {}: {}", rotated.display(), e),
        })?;

        inner.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::WalRotateFailed {
                reason: format!("reopen {}: {}", self.path.display(), e),
            })?;
        inner.size_bytes = 0;

        debug!(path = %self.path.display(), next_seq = inner.next_seq, "wal rotated");
        Ok(())
    }

    /// Iterate every record in the current file, in write order, invoking
    /// `handler` on each. Corrupt lines are skipped and counted.
    pub fn replay(&self, mut handler: impl FnMut(&WalRecord)) -> Result<ReplayStats> {
        // Hold the append lock so the pass sees a stable file.
        let _inner = self.inner.lock();

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReplayStats::default())
            }
            Err(e) => {
                return Err(Error::WalOpenFailed {
                    path: self.path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let mut stats = ReplayStats::default();
        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => {
                    stats.skipped += 1;
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            match WalRecord::decode(&line) {
                Some(record) => {
                    handler(&record);
                    stats.replayed += 1;
                }
                None => stats.skipped += 1,
            }
        }
        Ok(stats)
    }

    /// Path of the active log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The sequence number the next append will receive
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().next_seq
    }
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".1");
    PathBuf::from(os)
}

/// Scan an existing file for the highest sequence number; missing file is 0.
fn scan_last_seq(path: &Path) -> Result<(u64, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => {
            return Err(Error::WalOpenFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        }
    };

    let mut last_seq = 0u64;
    let mut skipped = 0u64;
    for line in BufReader::new(file).lines() {
        match line {
            Ok(l) if l.is_empty() => {}
            Ok(l) => match WalRecord::decode(&l) {
                Some(record) => last_seq = last_seq.max(record.seq_no),
                None => skipped += 1,
            },
            Err(_) => skipped += 1,
        }
    }
    Ok((last_seq, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn append_assigns_monotone_seq_from_one() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("test.wal")).unwrap();

        assert_eq!(wal.append("a1", "k1", "v1").unwrap(), 1);
        assert_eq!(wal.append("a1", "k2", "v2").unwrap(), 2);
        assert_eq!(wal.append("a2", "k1", "v3").unwrap(), 3);
        assert_eq!(wal.next_seq(), 4);
    }

    #[test]
    fn replay_returns_records_in_write_order() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("test.wal")).unwrap();

        wal.append("a1", "k", "v1").unwrap();
        wal.append("a1", "k", "v2").unwrap();

        let mut seen = Vec::new();
        let stats = wal.replay(|r| seen.push(r.clone())).unwrap();

        assert_eq!(stats, ReplayStats { replayed: 2, skipped: 0 });
        assert_eq!(seen[0].seq_no, 1);
        assert_eq!(seen[0].value, "v1");
        assert_eq!(seen[1].seq_no, 2);
        assert_eq!(seen[1].value, "v2");
        assert!(seen.iter().all(|r| r.actor_id == "a1" && r.key == "k"));
    }

    #[test]
    fn value_may_contain_separator() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("test.wal")).unwrap();

        wal.append("a1", "k", "x|y|z").unwrap();

        let mut seen = Vec::new();
        wal.replay(|r| seen.push(r.clone())).unwrap();
        assert_eq!(seen[0].value, "x|y|z");
    }

    #[test]
    fn replay_skips_corrupt_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        std::fs::write(&path, "1|100|a1|k|v\ngarbage\n2|oops|a1|k|v\n3|300|a1|k2|w\n").unwrap();

        let wal = Wal::open(&path).unwrap();
        let mut seen = Vec::new();
        let stats = wal.replay(|r| seen.push(r.seq_no)).unwrap();

        assert_eq!(stats, ReplayStats { replayed: 2, skipped: 2 });
        assert_eq!(seen, vec![1, 3]);
    }

    #[test]
    fn sequence_resumes_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let wal = Wal::open(&path).unwrap();
            wal.append("a1", "k", "v1").unwrap();
            wal.append("a1", "k", "v2").unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.append("a1", "k", "v3").unwrap(), 3);
    }

    #[test]
    fn rotation_keeps_one_predecessor_and_sequence_continues() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        // Two records (~24 bytes each) cross the threshold and rotate.
        let wal = Wal::open_with_max_size(&path, 30).unwrap();

        wal.append("a1", "k", "v1").unwrap();
        assert!(!rotated_path(&path).exists());

        wal.append("a1", "k", "v2").unwrap();
        assert!(rotated_path(&path).exists());

        let seq3 = wal.append("a1", "k", "v3").unwrap();
        assert_eq!(seq3, 3);

        // Current file holds only the post-rotation record.
        let mut seen = Vec::new();
        wal.replay(|r| seen.push(r.seq_no)).unwrap();
        assert_eq!(seen, vec![3]);
    }

    #[test]
    fn entry_handler_sees_every_append() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("test.wal")).unwrap();

        let count = Arc::new(AtomicU64::new(0));
        let last_seq = Arc::new(AtomicU64::new(0));
        {
            let count = Arc::clone(&count);
            let last_seq = Arc::clone(&last_seq);
            wal.set_entry_handler(move |record| {
                count.fetch_add(1, Ordering::SeqCst);
                last_seq.store(record.seq_no, Ordering::SeqCst);
            });
        }

        wal.append("a1", "k", "v1").unwrap();
        wal.append("a1", "k", "v2").unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(last_seq.load(Ordering::SeqCst), 2);
    }
}
