//! Scheduler: pool-driven mailbox dispatch and a timer thread.
//!
//! Construction submits the dispatch loop onto the worker pool (where it
//! occupies one worker for the scheduler's lifetime; size the pool
//! accordingly) and starts a dedicated timer thread. The dispatch loop
//! gives every registered mailbox a bounded drain per pass, so a busy
//! mailbox cannot starve the rest, and executes work items inline on the
//! loop's worker. Timers park on a condvar until the earliest task is due,
//! a new task arrives, or shutdown.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use nixie_core::constants::{DISPATCH_IDLE_SLEEP_MS, DISPATCH_POP_TIMEOUT_MS};
use nixie_core::Result;
use nixie_sync::{Mailbox, PopError, WorkerPool};

/// A unit of work destined for a mailbox
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// Mailbox of work items
pub type WorkMailbox = Mailbox<WorkItem>;

struct TimerEntry {
    run_at: Instant,
    /// Insertion order tiebreak for equal deadlines
    seq: u64,
    task: Arc<dyn Fn() + Send + Sync>,
    repeat_interval: Option<Duration>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.run_at.cmp(&other.run_at).then(self.seq.cmp(&other.seq))
    }
}

struct TimerState {
    heap: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    cv: Condvar,
    next_seq: AtomicU64,
}

/// Owns registered mailboxes (weakly), the worker pool, and the timers
pub struct Scheduler {
    pool: Arc<WorkerPool>,
    mailboxes: Arc<Mutex<Vec<Weak<WorkMailbox>>>>,
    timers: Arc<TimerState>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
    done: Arc<AtomicBool>,
}

impl Scheduler {
    /// Create a scheduler over `pool` and start its loops.
    pub fn new(pool: Arc<WorkerPool>) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            pool: Arc::clone(&pool),
            mailboxes: Arc::new(Mutex::new(Vec::new())),
            timers: Arc::new(TimerState {
                heap: Mutex::new(BinaryHeap::new()),
                cv: Condvar::new(),
                next_seq: AtomicU64::new(0),
            }),
            timer_thread: Mutex::new(None),
            done: Arc::new(AtomicBool::new(false)),
        });

        {
            let mailboxes = Arc::clone(&scheduler.mailboxes);
            let done = Arc::clone(&scheduler.done);
            if pool
                .submit(move || dispatch_loop(&mailboxes, &done))
                .is_err()
            {
                // Pool already stopped: nothing will dispatch, surface loudly.
                error!("scheduler could not start its dispatch loop");
            }
        }

        {
            let timers = Arc::clone(&scheduler.timers);
            let pool = Arc::clone(&scheduler.pool);
            let done = Arc::clone(&scheduler.done);
            let handle = thread::Builder::new()
                .name("nixie-timer".into())
                .spawn(move || timer_loop(&timers, &pool, &done))
                .expect("spawning timer thread");
            *scheduler.timer_thread.lock() = Some(handle);
        }

        scheduler
    }

    /// Register a mailbox for pool-driven dispatch. The scheduler holds
    /// only a weak reference; a dropped mailbox is pruned automatically.
    pub fn register(&self, mailbox: &Arc<WorkMailbox>) {
        if self.done.load(Ordering::SeqCst) {
            warn!("register after shutdown ignored");
            return;
        }
        self.mailboxes.lock().push(Arc::downgrade(mailbox));
    }

    /// Remove a previously registered mailbox.
    pub fn deregister(&self, mailbox: &Arc<WorkMailbox>) {
        let target = Arc::downgrade(mailbox);
        self.mailboxes
            .lock()
            .retain(|weak| !weak.ptr_eq(&target) && weak.strong_count() > 0);
    }

    /// Number of live registered mailboxes
    pub fn registered_count(&self) -> usize {
        self.mailboxes
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Run `task` once at `run_at`.
    pub fn schedule_at(&self, run_at: Instant, task: impl Fn() + Send + Sync + 'static) {
        self.insert_timer(run_at, Arc::new(task), None);
    }

    /// Run `task` once after `delay`.
    pub fn schedule_in(&self, delay: Duration, task: impl Fn() + Send + Sync + 'static) {
        self.schedule_at(Instant::now() + delay, task);
    }

    /// Run `task` every `interval`, first firing one interval from now.
    pub fn schedule_every(&self, interval: Duration, task: impl Fn() + Send + Sync + 'static) {
        debug_assert!(!interval.is_zero(), "repeat interval must be positive");
        self.insert_timer(Instant::now() + interval, Arc::new(task), Some(interval));
    }

    fn insert_timer(
        &self,
        run_at: Instant,
        task: Arc<dyn Fn() + Send + Sync>,
        repeat_interval: Option<Duration>,
    ) {
        if self.done.load(Ordering::SeqCst) {
            // The timer thread is gone; an entry pushed now would never fire.
            warn!("timer scheduled after shutdown ignored");
            return;
        }
        let entry = TimerEntry {
            run_at,
            seq: self.timers.next_seq.fetch_add(1, Ordering::Relaxed),
            task,
            repeat_interval,
        };
        self.timers.heap.lock().push(Reverse(entry));
        self.timers.cv.notify_one();
    }

    /// Number of timed tasks waiting to fire
    pub fn pending_timers(&self) -> usize {
        self.timers.heap.lock().len()
    }

    /// Stop everything: wake and join the timer thread, stop every
    /// registered mailbox (unblocking their consumers), then stop the pool.
    /// Undispatched timed tasks are dropped; in-flight work completes.
    pub fn shutdown(&self) -> Result<()> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("scheduler shutting down");

        {
            // Take the heap lock so the timer thread is parked, not mid-check.
            let _heap = self.timers.heap.lock();
        }
        self.timers.cv.notify_all();
        if let Some(handle) = self.timer_thread.lock().take() {
            if handle.join().is_err() {
                error!("timer thread terminated by panic");
            }
        }

        let mailboxes = std::mem::take(&mut *self.mailboxes.lock());
        for weak in mailboxes {
            if let Some(mailbox) = weak.upgrade() {
                mailbox.stop();
            }
        }

        self.pool.stop();
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// One pass per iteration: give each registered mailbox a drain bounded by
/// its length observed at the start of the pass, executing items inline.
fn dispatch_loop(mailboxes: &Mutex<Vec<Weak<WorkMailbox>>>, done: &AtomicBool) {
    let pop_timeout = Duration::from_millis(DISPATCH_POP_TIMEOUT_MS);
    debug!("dispatch loop starting");

    while !done.load(Ordering::SeqCst) {
        let snapshot: Vec<Weak<WorkMailbox>> = mailboxes.lock().clone();
        let mut saw_dead = false;

        for weak in &snapshot {
            let Some(mailbox) = weak.upgrade() else {
                saw_dead = true;
                continue;
            };
            // Drain what was queued when the pass reached this mailbox,
            // plus at most one late arrival caught by the timed pop.
            let quota = mailbox.len().max(1);
            for _ in 0..quota {
                match mailbox.wait_and_pop(pop_timeout) {
                    Ok(item) => {
                        if catch_unwind(AssertUnwindSafe(item)).is_err() {
                            error!("dispatched work item panicked");
                        }
                    }
                    Err(PopError::TimedOut) | Err(PopError::Stopped) => break,
                }
            }
        }

        if saw_dead {
            mailboxes.lock().retain(|w| w.strong_count() > 0);
        }

        // Avoid a tight spin when every mailbox is quiet.
        thread::sleep(Duration::from_millis(DISPATCH_IDLE_SLEEP_MS));
    }

    debug!("dispatch loop exiting");
}

fn timer_loop(timers: &TimerState, pool: &WorkerPool, done: &AtomicBool) {
    let mut heap = timers.heap.lock();

    while !done.load(Ordering::SeqCst) {
        let now = Instant::now();
        match heap.peek() {
            None => {
                timers.cv.wait(&mut heap);
            }
            Some(Reverse(head)) if head.run_at <= now => {
                let Some(Reverse(entry)) = heap.pop() else {
                    continue;
                };

                let task = Arc::clone(&entry.task);
                MutexGuard::unlocked(&mut heap, || {
                    let run = Arc::clone(&task);
                    if pool.submit(move || run()).is_err() {
                        warn!("pool stopped; timed task dropped");
                    }
                });

                if let Some(interval) = entry.repeat_interval {
                    heap.push(Reverse(TimerEntry {
                        run_at: now + interval,
                        seq: timers.next_seq.fetch_add(1, Ordering::Relaxed),
                        task: entry.task,
                        repeat_interval: Some(interval),
                    }));
                }
            }
            Some(Reverse(head)) => {
                let deadline = head.run_at;
                timers.cv.wait_until(&mut heap, deadline);
            }
        }
    }

    debug!("timer loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use nixie_sync::OverflowPolicy;
    use std::sync::atomic::AtomicUsize;

    fn scheduler_with_pool(threads: usize) -> Arc<Scheduler> {
        Scheduler::new(Arc::new(WorkerPool::new(threads)))
    }

    fn work_mailbox() -> Arc<WorkMailbox> {
        Arc::new(Mailbox::with_capacity(64, OverflowPolicy::Block))
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
    fn registered_mailbox_makes_progress_in_order() {
        let scheduler = scheduler_with_pool(2);
        let mailbox = work_mailbox();
        scheduler.register(&mailbox);

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = Arc::clone(&log);
            mailbox
                .push(Box::new(move || log.lock().push(i)) as WorkItem)
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(2), || log.lock().len() == 10));
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());

        scheduler.shutdown().unwrap();
    }

    #[test]
    fn two_mailboxes_both_progress() {
        let scheduler = scheduler_with_pool(2);
        let m1 = work_mailbox();
        let m2 = work_mailbox();
        scheduler.register(&m1);
        scheduler.register(&m2);

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            for mb in [&m1, &m2] {
                let count = Arc::clone(&count);
                mb.push(Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }) as WorkItem)
                .unwrap();
            }
        }

        assert!(wait_until(Duration::from_secs(2), || {
            count.load(Ordering::SeqCst) == 10
        }));
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn deregistered_mailbox_is_left_alone() {
        let scheduler = scheduler_with_pool(2);
        let mailbox = work_mailbox();
        scheduler.register(&mailbox);
        assert_eq!(scheduler.registered_count(), 1);

        scheduler.deregister(&mailbox);
        assert_eq!(scheduler.registered_count(), 0);

        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            mailbox
                .push(Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }) as WorkItem)
                .unwrap();
        }

        thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(mailbox.len(), 1);

        scheduler.shutdown().unwrap();
    }

    #[test]
    fn one_shot_timer_fires_once() {
        let scheduler = scheduler_with_pool(2);
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            scheduler.schedule_in(Duration::from_millis(30), move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(wait_until(Duration::from_secs(2), || {
            count.load(Ordering::SeqCst) == 1
        }));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_timers(), 0);

        scheduler.shutdown().unwrap();
    }

    #[test]
    fn repeating_timer_reschedules_itself() {
        let scheduler = scheduler_with_pool(2);
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            scheduler.schedule_every(Duration::from_millis(20), move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(wait_until(Duration::from_secs(3), || {
            count.load(Ordering::SeqCst) >= 3
        }));
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn shutdown_stops_registered_mailboxes_and_pool() {
        let scheduler = scheduler_with_pool(2);
        let mailbox = work_mailbox();
        scheduler.register(&mailbox);

        scheduler.shutdown().unwrap();

        assert!(mailbox.is_stopped());
        // Further scheduling and registration are inert after shutdown.
        scheduler.schedule_in(Duration::from_millis(1), || {});
        scheduler.schedule_every(Duration::from_millis(1), || {});
        scheduler.register(&work_mailbox());
        assert_eq!(scheduler.pending_timers(), 0);
        assert_eq!(scheduler.registered_count(), 0);

        // Idempotent.
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn panicking_timed_task_does_not_kill_the_pool() {
        let scheduler = scheduler_with_pool(2);
        scheduler.schedule_in(Duration::from_millis(10), || panic!("bad task"));

        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            scheduler.schedule_in(Duration::from_millis(40), move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(wait_until(Duration::from_secs(2), || {
            count.load(Ordering::SeqCst) == 1
        }));
        scheduler.shutdown().unwrap();
    }
}
