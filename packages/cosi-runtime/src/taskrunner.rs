//! Reconciles a desired set of named tasks against the set actually running,
//! starting, restarting, and stopping `tokio` tasks to match.
//!
//! Grounded on the spawn/cancel/select shape `facade.rs`'s
//! `context_with_teardown` and `storage/collection.rs`'s `Subscription`
//! already use for a single background task, generalized here to a whole
//! supervised population keyed by task id, with panic/error restart backoff
//! read from [`crate::config::RuntimeConfig`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cosi_core::error::CoreResult;

use crate::config::RuntimeConfig;

/// Builds the future that runs a single task's body for a given input.
///
/// Implementations should honor `cancel` promptly: [`TaskRunner::reconcile`]
/// cancels and aborts a running task's handle when it is no longer desired or
/// its input changed, but a cooperative exit lets in-progress work wind down
/// instead of being cut off mid-step.
pub trait TaskFactory<T>: Send + Sync {
    fn spawn(&self, input: T, cancel: CancellationToken) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send>>;
}

struct RunningTask<T> {
    input: T,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Supervises the population of tasks a controller wants alive, diffing a
/// desired `id -> input` map against what is currently running.
pub struct TaskRunner<T> {
    factory: Arc<dyn TaskFactory<T>>,
    config: RuntimeConfig,
    running: Mutex<HashMap<String, RunningTask<T>>>,
}

impl<T> TaskRunner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(config: RuntimeConfig, factory: Arc<dyn TaskFactory<T>>) -> Self {
        Self {
            factory,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Stops tasks no longer present in `desired`, starts tasks newly
    /// present, and restarts tasks whose input changed. Tasks whose input is
    /// unchanged are left running untouched.
    pub fn reconcile(&self, desired: &HashMap<String, T>) {
        let mut running = self.running.lock();

        let to_stop: Vec<String> = running
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in &to_stop {
            if let Some(task) = running.remove(id) {
                task.cancel.cancel();
                task.handle.abort();
                debug!(task_id = %id, "stopped task no longer desired");
            }
        }

        for (id, input) in desired {
            let needs_restart = match running.get(id) {
                Some(existing) => &existing.input != input,
                None => true,
            };
            if !needs_restart {
                continue;
            }
            if let Some(old) = running.remove(id) {
                old.cancel.cancel();
                old.handle.abort();
                debug!(task_id = %id, "restarting task with changed input");
            }
            running.insert(id.clone(), self.start(id.clone(), input.clone()));
        }
    }

    fn start(&self, id: String, input: T) -> RunningTask<T> {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(
            id,
            input.clone(),
            Arc::clone(&self.factory),
            cancel.clone(),
            self.config.clone(),
        ));
        RunningTask { input, cancel, handle }
    }

    /// Stops a single task by id, if running.
    pub fn stop(&self, id: &str) {
        if let Some(task) = self.running.lock().remove(id) {
            task.cancel.cancel();
            task.handle.abort();
        }
    }

    /// Stops every running task.
    pub fn stop_all(&self) {
        for (_, task) in self.running.lock().drain() {
            task.cancel.cancel();
            task.handle.abort();
        }
    }

    #[must_use]
    pub fn running_ids(&self) -> Vec<String> {
        self.running.lock().keys().cloned().collect()
    }
}

/// Runs `input`'s task body to completion, restarting it with jittered
/// exponential backoff whenever it panics, returns an error, or even exits
/// cleanly -- the reconcile contract is that a desired task stays alive until
/// `cancel` fires, so any other exit is treated as abnormal and retried.
async fn supervise<T>(
    id: String,
    input: T,
    factory: Arc<dyn TaskFactory<T>>,
    cancel: CancellationToken,
    config: RuntimeConfig,
) where
    T: Clone + Send + Sync + 'static,
{
    let mut backoff_ms = config.task_restart_backoff_min_ms;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let attempt = tokio::spawn(factory.spawn(input.clone(), cancel.clone()));
        let outcome = attempt.await;

        if cancel.is_cancelled() {
            return;
        }

        match outcome {
            Ok(Ok(())) => {
                debug!(task_id = %id, "task exited cleanly; restarting per reconcile contract");
                backoff_ms = config.task_restart_backoff_min_ms;
            }
            Ok(Err(err)) => {
                warn!(task_id = %id, error = %err, "task returned an error, restarting after backoff");
            }
            Err(join_err) => {
                warn!(task_id = %id, panicked = join_err.is_panic(), "task runner worker terminated abnormally, restarting after backoff");
            }
        }

        let jitter_ms = rand::rng().random_range(0..=(backoff_ms / 4).max(1));
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(backoff_ms + jitter_ms)) => {}
            () = cancel.cancelled() => return,
        }
        backoff_ms = backoff_ms.saturating_mul(2).min(config.task_restart_backoff_max_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, PartialEq, Eq, Debug)]
    struct Spec(u32);

    struct CountingFactory {
        starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskFactory<Spec> for CountingFactory {
        fn spawn(&self, _input: Spec, cancel: CancellationToken) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send>> {
            let starts = Arc::clone(&self.starts);
            Box::pin(async move {
                starts.fetch_add(1, Ordering::SeqCst);
                cancel.cancelled().await;
                Ok(())
            })
        }
    }

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            task_restart_backoff_min_ms: 5,
            task_restart_backoff_max_ms: 20,
            ..RuntimeConfig::default()
        }
    }

    #[tokio::test]
    async fn reconcile_starts_and_stops_tasks() {
        let starts = Arc::new(AtomicUsize::new(0));
        let runner = TaskRunner::new(fast_config(), Arc::new(CountingFactory { starts: Arc::clone(&starts) }));

        let mut desired = HashMap::new();
        desired.insert("a".to_string(), Spec(1));
        runner.reconcile(&desired);
        tokio::task::yield_now().await;
        assert_eq!(runner.running_ids(), vec!["a".to_string()]);
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        runner.reconcile(&HashMap::new());
        assert!(runner.running_ids().is_empty());
    }

    #[tokio::test]
    async fn input_change_restarts_task() {
        let starts = Arc::new(AtomicUsize::new(0));
        let runner = TaskRunner::new(fast_config(), Arc::new(CountingFactory { starts: Arc::clone(&starts) }));

        let mut desired = HashMap::new();
        desired.insert("a".to_string(), Spec(1));
        runner.reconcile(&desired);
        tokio::task::yield_now().await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        desired.insert("a".to_string(), Spec(2));
        runner.reconcile(&desired);
        tokio::task::yield_now().await;
        assert_eq!(starts.load(Ordering::SeqCst), 2, "changed input restarts the task");
    }

    #[tokio::test]
    async fn unchanged_input_is_left_running() {
        let starts = Arc::new(AtomicUsize::new(0));
        let runner = TaskRunner::new(fast_config(), Arc::new(CountingFactory { starts: Arc::clone(&starts) }));

        let mut desired = HashMap::new();
        desired.insert("a".to_string(), Spec(1));
        runner.reconcile(&desired);
        tokio::task::yield_now().await;
        runner.reconcile(&desired);
        tokio::task::yield_now().await;
        assert_eq!(starts.load(Ordering::SeqCst), 1, "identical input is not restarted");
    }

    struct FailsOnceFactory {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskFactory<Spec> for FailsOnceFactory {
        fn spawn(&self, _input: Spec, cancel: CancellationToken) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send>> {
            let attempts = Arc::clone(&self.attempts);
            Box::pin(async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    return Err(cosi_core::error::CoreError::Unsupported("boom".to_string()));
                }
                cancel.cancelled().await;
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn errored_task_restarts_after_backoff() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let runner = TaskRunner::new(fast_config(), Arc::new(FailsOnceFactory { attempts: Arc::clone(&attempts) }));

        let mut desired = HashMap::new();
        desired.insert("a".to_string(), Spec(1));
        runner.reconcile(&desired);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2, "restarted after the error backoff elapsed");

        runner.stop_all();
    }

    #[tokio::test]
    async fn stop_cancels_a_single_task() {
        let starts = Arc::new(AtomicUsize::new(0));
        let runner = TaskRunner::new(fast_config(), Arc::new(CountingFactory { starts }));
        let mut desired = HashMap::new();
        desired.insert("a".to_string(), Spec(1));
        desired.insert("b".to_string(), Spec(1));
        runner.reconcile(&desired);
        tokio::task::yield_now().await;

        runner.stop("a");
        let mut ids = runner.running_ids();
        ids.sort();
        assert_eq!(ids, vec!["b".to_string()]);
    }
}
