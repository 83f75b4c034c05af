//! Write-behind flusher in front of the WAL.
//!
//! Dirty records land on a DropOldest queue so the hot path never blocks;
//! under saturation the most recent writes win and the evictions are
//! counted. The flusher thread accumulates a batch and appends it to the
//! WAL in insertion order when the batch fills or a pop timeout fires with
//! records in hand.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use nixie_core::constants::{
    WRITE_BEHIND_BATCH_COUNT_DEFAULT, WRITE_BEHIND_POP_TIMEOUT_MS, WRITE_BEHIND_QUEUE_CAPACITY,
};
use nixie_sync::{Mailbox, OverflowPolicy, PopError};

use crate::wal::Wal;

/// A store mutation awaiting its WAL append
#[derive(Debug, Clone)]
pub struct DirtyRecord {
    pub actor_id: String,
    pub key: String,
    pub value: String,
}

/// Background batching flusher
pub struct WriteBehindWorker {
    queue: Arc<Mailbox<DirtyRecord>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    flush_errors: Arc<AtomicU64>,
}

impl WriteBehindWorker {
    /// Create and start the flusher with the default batch size.
    pub fn start(wal: Arc<Wal>) -> Self {
        Self::start_with_batch_size(wal, WRITE_BEHIND_BATCH_COUNT_DEFAULT)
    }

    /// Create and start the flusher with an explicit batch size.
    pub fn start_with_batch_size(wal: Arc<Wal>, batch_size: usize) -> Self {
        debug_assert!(batch_size > 0);

        let queue = Arc::new(Mailbox::with_capacity(
            WRITE_BEHIND_QUEUE_CAPACITY,
            OverflowPolicy::DropOldest,
        ));
        let running = Arc::new(AtomicBool::new(true));
        let flush_errors = Arc::new(AtomicU64::new(0));

        let flusher = {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let flush_errors = Arc::clone(&flush_errors);
            thread::Builder::new()
                .name("nixie-write-behind".into())
                .spawn(move || flusher_loop(&queue, &wal, batch_size, &running, &flush_errors))
                .expect("spawning write-behind flusher")
        };

        Self {
            queue,
            flusher: Mutex::new(Some(flusher)),
            running,
            flush_errors,
        }
    }

    /// Hand a dirty record to the flusher. Never blocks; under saturation
    /// the oldest queued record is evicted.
    pub fn enqueue(&self, record: DirtyRecord) {
        let before = self.queue.dropped_count();
        if self.queue.push(record).is_err() {
            // Only happens after stop; the write is already acknowledged.
            warn!("write-behind enqueue after stop; record not logged");
            return;
        }
        let evicted = self.queue.dropped_count() - before;
        if evicted > 0 {
            warn!(evicted, "write-behind queue saturated, oldest records evicted");
        }
    }

    /// Records waiting to be flushed
    pub fn queued_records(&self) -> usize {
        self.queue.len()
    }

    /// Evictions due to queue saturation
    pub fn dropped_records(&self) -> u64 {
        self.queue.dropped_count()
    }

    /// WAL appends that failed (logged and skipped)
    pub fn flush_errors(&self) -> u64 {
        self.flush_errors.load(Ordering::Relaxed)
    }

    /// Stop the flusher: it flushes the batch it holds, then exits.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.stop();
        if let Some(handle) = self.flusher.lock().take() {
            if handle.join().is_err() {
                error!("write-behind flusher terminated by panic");
            }
        }
    }
}

impl Drop for WriteBehindWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn flusher_loop(
    queue: &Mailbox<DirtyRecord>,
    wal: &Wal,
    batch_size: usize,
    running: &AtomicBool,
    flush_errors: &AtomicU64,
) {
    let timeout = Duration::from_millis(WRITE_BEHIND_POP_TIMEOUT_MS);
    let mut batch: Vec<DirtyRecord> = Vec::with_capacity(batch_size);

    loop {
        match queue.wait_and_pop(timeout) {
            Ok(record) => {
                batch.push(record);
                if batch.len() >= batch_size {
                    flush(wal, &mut batch, flush_errors);
                }
            }
            Err(PopError::TimedOut) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if !batch.is_empty() {
                    flush(wal, &mut batch, flush_errors);
                }
            }
            Err(PopError::Stopped) => break,
        }
    }

    // Exit after draining the batch in hand.
    flush(wal, &mut batch, flush_errors);
    debug!("write-behind flusher exiting");
}

fn flush(wal: &Wal, batch: &mut Vec<DirtyRecord>, flush_errors: &AtomicU64) {
    if batch.is_empty() {
        return;
    }
    for record in batch.drain(..) {
        if let Err(e) = wal.append(&record.actor_id, &record.key, &record.value) {
            // Write-behind mode: the write was already acknowledged, so the
            // in-memory state is ahead of the log. Log and keep going.
            flush_errors.fetch_add(1, Ordering::Relaxed);
            error!(actor_id = %record.actor_id, key = %record.key, error = %e,
                   "write-behind wal append failed");
        }
    }
    debug!("write-behind flushed batch");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    fn record(key: &str, value: &str) -> DirtyRecord {
        DirtyRecord {
            actor_id: "a1".into(),
            key: key.into(),
            value: value.into(),
        }
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn flushes_full_batches_in_order() {
        // Scenario S5: batch=3, five sets, WAL ends up with all five in order.
        let dir = tempdir().unwrap();
        let wal = Arc::new(Wal::open(dir.path().join("wb.wal")).unwrap());
        let worker = WriteBehindWorker::start_with_batch_size(Arc::clone(&wal), 3);

        for i in 1..=5 {
            worker.enqueue(record(&format!("k{i}"), &format!("v{i}")));
        }

        // First flush on the full batch, second on the pop timeout.
        assert!(wait_until(Duration::from_secs(2), || wal.next_seq() == 6));

        let mut seen = Vec::new();
        wal.replay(|r| seen.push((r.seq_no, r.key.clone(), r.value.clone())))
            .unwrap();
        assert_eq!(seen.len(), 5);
        for (i, (seq, key, value)) in seen.iter().enumerate() {
            assert_eq!(*seq, i as u64 + 1);
            assert_eq!(key, &format!("k{}", i + 1));
            assert_eq!(value, &format!("v{}", i + 1));
        }
        worker.stop();
    }

    #[test]
    fn stop_drains_batch_in_hand() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(Wal::open(dir.path().join("wb.wal")).unwrap());
        // Batch larger than what we enqueue, so only stop can flush it.
        let worker = WriteBehindWorker::start_with_batch_size(Arc::clone(&wal), 100);

        worker.enqueue(record("k1", "v1"));
        worker.enqueue(record("k2", "v2"));

        // Let the flusher pull the records into its batch.
        assert!(wait_until(Duration::from_secs(2), || worker.queued_records() == 0));
        worker.stop();

        let mut seen = Vec::new();
        wal.replay(|r| seen.push(r.key.clone())).unwrap();
        assert_eq!(seen, vec!["k1", "k2"]);
    }

    #[test]
    fn enqueue_never_blocks() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(Wal::open(dir.path().join("wb.wal")).unwrap());
        let worker = WriteBehindWorker::start_with_batch_size(wal, 100);

        let start = Instant::now();
        for i in 0..(WRITE_BEHIND_QUEUE_CAPACITY * 2) {
            worker.enqueue(record(&format!("k{i}"), "v"));
        }
        // DropOldest: saturation evicts instead of blocking the caller.
        assert!(start.elapsed() < Duration::from_secs(1));
        worker.stop();
    }
}
