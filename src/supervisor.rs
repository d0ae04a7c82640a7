// =============================================================================
// Supervised background tasks
// =============================================================================
//
// Each long-running loop runs under `supervise`, which:
//   - catches errors and panics from the loop,
//   - records them in a bounded failure log and on a broadcast channel,
//   - restarts the loop after an exponential backoff,
//   - stops for good once the shutdown flag is set.
//
// A run that lasted longer than the backoff ceiling resets the backoff.
// =============================================================================

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

/// Maximum number of failures retained in the log.
pub const MAX_TASK_FAILURES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    pub base: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            max: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `consecutive` (1-based).
    pub fn delay(&self, consecutive: u32) -> Duration {
        let exp = consecutive.saturating_sub(1).min(31);
        let mult = self.factor.max(1).saturating_pow(exp);
        self.base.saturating_mul(mult).min(self.max)
    }
}

/// One recorded failure of a supervised task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task: String,
    pub error: String,
    pub consecutive: u32,
    pub restart_in_ms: u64,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Bounded log of recent task failures plus a live feed of new ones.
pub struct FailureLog {
    entries: RwLock<VecDeque<TaskFailure>>,
    tx: broadcast::Sender<TaskFailure>,
}

impl FailureLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MAX_TASK_FAILURES);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(MAX_TASK_FAILURES)),
            tx,
        }
    }

    pub fn record(&self, failure: TaskFailure) {
        {
            let mut entries = self.entries.write();
            if entries.len() >= MAX_TASK_FAILURES {
                entries.pop_front();
            }
            entries.push_back(failure.clone());
        }
        // No receivers is fine.
        let _ = self.tx.send(failure);
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<TaskFailure> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskFailure> {
        self.tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for FailureLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FailureLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureLog").field("len", &self.len()).finish()
    }
}

/// Run `factory()` until shutdown, restarting it with backoff whenever it
/// errors, panics, or returns while the engine is still running.
pub fn supervise<F, Fut>(
    name: &'static str,
    policy: RestartPolicy,
    failures: Arc<FailureLog>,
    mut shutdown: watch::Receiver<bool>,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut consecutive = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let error = match tokio::spawn(factory()).await {
                Ok(Ok(())) if *shutdown.borrow() => break,
                Ok(Ok(())) => "task exited while engine was running".to_string(),
                Ok(Err(e)) => format!("{e:#}"),
                Err(join) if join.is_panic() => format!("task panicked: {join}"),
                Err(_) => break,
            };

            if started.elapsed() > policy.max {
                consecutive = 0;
            }
            consecutive += 1;
            let delay = policy.delay(consecutive);

            error!(
                task = name,
                error = %error,
                consecutive,
                restart_in_ms = delay.as_millis() as u64,
                "supervised task failed"
            );
            failures.record(TaskFailure {
                task: name.to_string(),
                error,
                consecutive,
                restart_in_ms: delay.as_millis() as u64,
                at: Utc::now().to_rfc3339(),
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(task = name, "supervised task stopped");
    })
}
