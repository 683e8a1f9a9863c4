use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use common::{ErrorPolicy, Result};

/// A named unit of recurring work with its own period.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;
    fn period(&self) -> Duration;
    async fn run(&self) -> Result<()>;
}

/// Runs each registered task on its own interval loop.
///
/// One run failure never stops a task's loop, and one task never blocks
/// another. `start` is idempotent; `stop` is graceful: in-flight runs
/// complete, no new one begins.
pub struct Scheduler {
    tasks: Vec<Arc<dyn Task>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(tasks: Vec<Arc<dyn Task>>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tasks,
            running: AtomicBool::new(false),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn all task loops. A second call while running is a no-op and
    /// returns false.
    pub async fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Scheduler already running; start ignored");
            return false;
        }
        self.shutdown_tx.send_replace(false);

        let mut handles = self.handles.lock().await;
        for task in &self.tasks {
            let task = task.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            info!(task = task.name(), period = ?task.period(), "Task scheduled");

            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(task.period());
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            // The run is awaited inside this arm, so a stop
                            // request only takes effect between ticks.
                            if let Err(e) = task.run().await {
                                match e.policy() {
                                    ErrorPolicy::Escalate => {
                                        error!(task = task.name(), error = %e, "Task run failed")
                                    }
                                    ErrorPolicy::Retry | ErrorPolicy::Skip => {
                                        warn!(task = task.name(), policy = ?e.policy(), error = %e, "Task run failed")
                                    }
                                }
                            }
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!(task = task.name(), "Task loop stopped");
            }));
        }
        true
    }

    /// Graceful stop: finish the current run of every task, start no new one.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        info!("Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTask {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Task for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn period(&self) -> Duration {
            Duration::from_millis(10)
        }
        async fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(common::Error::AdapterUnavailable("stub".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_halts_runs() {
        let task = Arc::new(CountingTask {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let scheduler = Scheduler::new(vec![task.clone()]);

        assert!(scheduler.start().await);
        assert!(!scheduler.start().await, "double start must be a no-op");

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop().await;
        let after_stop = task.runs.load(Ordering::SeqCst);
        assert!(after_stop > 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            task.runs.load(Ordering::SeqCst),
            after_stop,
            "no new runs after stop"
        );
    }

    #[tokio::test]
    async fn failing_task_keeps_its_loop_alive() {
        let task = Arc::new(CountingTask {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let scheduler = Scheduler::new(vec![task.clone()]);
        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.stop().await;

        assert!(
            task.runs.load(Ordering::SeqCst) >= 3,
            "loop should keep running through failures"
        );
    }
}
