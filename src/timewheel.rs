//! Deferred Task Scheduling
//!
//! Schedules named callbacks for a wall-clock instant, with cancellation
//! by name. Key expiration registers a task per key here; PERSIST, DEL,
//! and overwrites cancel it.
//!
//! The implementation is a single reaper task over a deadline-ordered
//! queue: a `BTreeMap` keyed by `(fire_time, seq)` plus a name index.
//! Scheduling a name that already exists replaces the previous entry
//! (the sequence number fences off the stale deadline).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A scheduled callback.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum WheelOp {
    At { task: String, at_ms: u64, job: Job },
    Cancel { task: String },
}

/// Handle to the scheduling task. Dropping the handle (or calling
/// [`TimeWheel::stop`]) stops the reaper.
pub struct TimeWheel {
    ops: mpsc::UnboundedSender<WheelOp>,
    shutdown: watch::Sender<bool>,
}

impl TimeWheel {
    /// Spawns the reaper task and returns the shared handle.
    pub fn start() -> Arc<Self> {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(reaper_loop(ops_rx, shutdown_rx));
        Arc::new(Self {
            ops: ops_tx,
            shutdown: shutdown_tx,
        })
    }

    /// A wheel that accepts and discards every operation. Auxiliary
    /// replay databases use one: they only need TTL bookkeeping, not
    /// scheduled removal, and they may live outside the runtime.
    pub fn inert() -> Arc<Self> {
        let (ops_tx, _) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            ops: ops_tx,
            shutdown: shutdown_tx,
        })
    }

    /// Schedules `job` to run at `at_ms` (epoch milliseconds) under the
    /// given task name, replacing any pending task with the same name.
    pub fn at(&self, at_ms: u64, task: impl Into<String>, job: Job) {
        let _ = self.ops.send(WheelOp::At {
            task: task.into(),
            at_ms,
            job,
        });
    }

    /// Cancels a pending task by name. Unknown names are ignored.
    pub fn cancel(&self, task: &str) {
        let _ = self.ops.send(WheelOp::Cancel {
            task: task.to_string(),
        });
    }

    /// Stops the reaper task.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for TimeWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn reaper_loop(mut ops: mpsc::UnboundedReceiver<WheelOp>, mut shutdown: watch::Receiver<bool>) {
    let mut deadlines: BTreeMap<(u64, u64), String> = BTreeMap::new();
    let mut jobs: HashMap<String, (u64, u64, Job)> = HashMap::new();
    let mut seq = 0u64;

    loop {
        let sleep = match deadlines.keys().next() {
            Some(&(at_ms, _)) => Duration::from_millis(at_ms.saturating_sub(now_ms())),
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {
                let now = now_ms();
                while let Some((&(at_ms, entry_seq), _)) = deadlines.first_key_value() {
                    if at_ms > now {
                        break;
                    }
                    let task = deadlines
                        .remove(&(at_ms, entry_seq))
                        .expect("deadline entry present");
                    // A stale deadline from a replaced schedule carries an
                    // old sequence number; skip it.
                    let fire = matches!(jobs.get(&task), Some(&(s, _, _)) if s == entry_seq);
                    if fire {
                        let (_, _, job) = jobs.remove(&task).expect("job present");
                        trace!(task = %task, "firing scheduled task");
                        job();
                    }
                }
            }
            op = ops.recv() => {
                match op {
                    Some(WheelOp::At { task, at_ms, job }) => {
                        seq += 1;
                        if let Some((_, old_at, _)) = jobs.insert(task.clone(), (seq, at_ms, job)) {
                            // the stale deadline is fenced by its old seq;
                            // removing it keeps the queue small
                            deadlines.retain(|_, name| name != &task);
                            trace!(task = %task, old_at, "rescheduled task");
                        }
                        deadlines.insert((at_ms, seq), task);
                    }
                    Some(WheelOp::Cancel { task }) => {
                        if jobs.remove(&task).is_some() {
                            deadlines.retain(|_, name| name != &task);
                        }
                    }
                    None => return,
                }
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    debug!(pending = jobs.len(), "time wheel shut down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_task_fires_at_deadline() {
        let wheel = TimeWheel::start();
        let fired = Arc::new(AtomicU32::new(0));

        let fired2 = Arc::clone(&fired);
        wheel.at(now_ms() + 30, "t1", Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let wheel = TimeWheel::start();
        let fired = Arc::new(AtomicU32::new(0));

        let fired2 = Arc::clone(&fired);
        wheel.at(now_ms() + 50, "t1", Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        wheel.cancel("t1");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reschedule_replaces_previous() {
        let wheel = TimeWheel::start();
        let fired = Arc::new(AtomicU32::new(0));

        for delay in [40u64, 60, 80] {
            let fired2 = Arc::clone(&fired);
            wheel.at(now_ms() + delay, "same-task", Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_past_deadline_fires_immediately() {
        let wheel = TimeWheel::start();
        let fired = Arc::new(AtomicU32::new(0));

        let fired2 = Arc::clone(&fired);
        wheel.at(now_ms().saturating_sub(1000), "past", Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
