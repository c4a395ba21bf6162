//! Dispatch loop and element execution

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::{
    DuplicateReason, ElementOutcome, QueueElement, SchedulerConfig, SchedulerError, SubmitRequest,
    Submission,
};
use crate::compare::Comparator;
use crate::identifier::{RunIdentifier, RunStatus};
use crate::persistence::{RunFilter, RunStore};
use crate::run::RunExecutor;

#[derive(Default)]
struct QueueState {
    elements: HashMap<RunIdentifier, QueueElement>,
    in_flight: usize,
    next_seq: u64,
}

/// Owns the execution queue and its concurrency accounting
///
/// Constructed once and shared by `Arc`. The queue map and the in-flight
/// counter live behind one lock that is never held across an await.
///
/// # Example
///
/// ```ignore
/// let scheduler = Scheduler::new(config, store.clone(), executor, Some(comparator));
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// tokio::spawn(scheduler.clone().run(shutdown_rx));
///
/// scheduler
///     .submit(SubmitRequest::new(identifier, "/etc/benchrun/micro.toml"))
///     .await?;
/// ```
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn RunStore>,
    executor: Arc<dyn RunExecutor>,
    comparator: Option<Arc<Comparator>>,
    state: Mutex<QueueState>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn RunStore>,
        executor: Arc<dyn RunExecutor>,
        comparator: Option<Arc<Comparator>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: config.normalized(),
            store,
            executor,
            comparator,
            state: Mutex::new(QueueState::default()),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue a request unless its identifier is already queued or finished
    #[instrument(skip(self, request), fields(identifier = %request.identifier))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, SchedulerError> {
        if self.exists(&request.identifier, RunStatus::Finished).await? {
            debug!("Identifier already finished");
            return Ok(Submission::Duplicate(DuplicateReason::AlreadyFinished));
        }

        let mut state = self.state.lock();
        if state.elements.contains_key(&request.identifier) {
            debug!("Identifier already queued");
            return Ok(Submission::Duplicate(DuplicateReason::Queued));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let element = QueueElement {
            identifier: request.identifier.clone(),
            config_path: request.config_path,
            retry: request.retry.unwrap_or(self.config.default_retries),
            executing: false,
            notify_always: request.notify_always,
            compare_with: request.compare_with,
            seq,
        };
        state.elements.insert(request.identifier, element);
        info!(queued = state.elements.len(), "Submission accepted");
        Ok(Submission::Accepted)
    }

    /// Admit the oldest pending element if capacity allows
    ///
    /// Marks it executing and takes one slot.
    pub fn try_dispatch_one(&self) -> Option<QueueElement> {
        let mut state = self.state.lock();
        if state.in_flight >= self.config.max_concurrent_jobs {
            return None;
        }

        let identifier = state
            .elements
            .values()
            .filter(|e| !e.executing)
            .min_by_key(|e| e.seq)
            .map(|e| e.identifier.clone())?;

        let element = state.elements.get_mut(&identifier)?;
        element.executing = true;
        let dispatched = element.clone();
        state.in_flight += 1;
        Some(dispatched)
    }

    /// Dispatch loop: one admission per tick until shutdown
    ///
    /// Stops once `shutdown` holds `true` or its sender is dropped, then
    /// waits up to `shutdown_grace` for running elements before aborting
    /// them.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            dispatch_interval = ?self.config.dispatch_interval,
            "Starting scheduler"
        );

        let mut ticker = tokio::time::interval(self.config.dispatch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                debug!("Dispatch loop: shutdown requested");
                break;
            }
            while running.try_join_next().is_some() {}

            if let Some(element) = self.try_dispatch_one() {
                debug!(identifier = %element.identifier, "Dispatching element");
                let scheduler = Arc::clone(&self);
                let shutdown = shutdown.clone();
                running.spawn(async move { scheduler.execute_element(element, shutdown).await });
            }
        }

        self.drain(running).await;
        info!(in_flight = self.in_flight(), "Scheduler stopped");
    }

    async fn drain(&self, mut running: JoinSet<ElementOutcome>) {
        if running.is_empty() {
            return;
        }
        info!(
            running = running.len(),
            grace = ?self.config.shutdown_grace,
            "Waiting for running elements"
        );
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while running.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(running = running.len(), "Shutdown grace expired, aborting running elements");
            running.shutdown().await;
        }
    }

    /// Run the attempts of a dispatched element, then release it
    ///
    /// Attempts are strictly sequential. Each runs on its own task so a
    /// panicking executor counts as a failed attempt.
    #[instrument(skip_all, fields(identifier = %element.identifier))]
    pub async fn execute_element(
        self: &Arc<Self>,
        element: QueueElement,
        shutdown: watch::Receiver<bool>,
    ) -> ElementOutcome {
        let max_attempts = element.max_attempts();
        let mut outcome = ElementOutcome::Exhausted {
            attempts: max_attempts,
        };

        for attempt in 1..=max_attempts {
            let delay = self.config.retry_policy.delay_for_attempt(attempt);
            if !delay.is_zero() {
                debug!(attempt, ?delay, "Waiting before retry");
                tokio::time::sleep(delay).await;
            }

            let executor = Arc::clone(&self.executor);
            let identifier = element.identifier.clone();
            let config_path = element.config_path.clone();
            let handle =
                tokio::spawn(async move { executor.execute(&identifier, &config_path).await });

            match handle.await {
                Ok(Ok(())) => {
                    outcome = ElementOutcome::Succeeded { attempts: attempt };
                    break;
                }
                Ok(Err(e)) => {
                    warn!(attempt, max_attempts, error = %e, "Attempt failed");
                }
                Err(e) => {
                    error!(attempt, max_attempts, error = %e, "Attempt panicked");
                }
            }
        }

        match outcome {
            ElementOutcome::Succeeded { attempts } => {
                info!(attempts, "Element succeeded");
                self.spawn_comparison(&element, shutdown);
            }
            ElementOutcome::Exhausted { attempts } => {
                error!(attempts, "Retry budget exhausted, dropping element");
            }
        }

        self.release(&element.identifier);
        outcome
    }

    fn spawn_comparison(&self, element: &QueueElement, shutdown: watch::Receiver<bool>) {
        let Some(comparator) = self.comparator.clone() else {
            return;
        };
        if element.compare_with.is_empty() {
            return;
        }

        let finished = element.identifier.clone();
        let targets = element.compare_with.clone();
        let notify_always = element.notify_always;
        tokio::spawn(async move {
            match comparator
                .compare(&finished, &targets, notify_always, shutdown)
                .await
            {
                Ok(outcome) => {
                    debug!(identifier = %finished, matched = outcome.matched, notified = outcome.notified, "Comparison done")
                }
                Err(e) => error!(identifier = %finished, error = %e, "Comparison aborted"),
            }
        });
    }

    /// Remove the element and free its slot in one critical section
    fn release(&self, identifier: &RunIdentifier) {
        let mut state = self.state.lock();
        state.elements.remove(identifier);
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Whether an element with this identifier is queued or executing
    pub fn contains(&self, identifier: &RunIdentifier) -> bool {
        self.state.lock().elements.contains_key(identifier)
    }

    /// Snapshot of the element queued under this identifier
    pub fn element(&self, identifier: &RunIdentifier) -> Option<QueueElement> {
        self.state.lock().elements.get(identifier).cloned()
    }

    /// Number of queued or executing elements
    pub fn len(&self) -> usize {
        self.state.lock().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.config.max_concurrent_jobs
    }

    /// Whether a run with this identifier exists with `status`
    ///
    /// Micro identifiers ignore the planner version.
    pub async fn exists(
        &self,
        identifier: &RunIdentifier,
        status: RunStatus,
    ) -> Result<bool, SchedulerError> {
        Ok(self
            .store
            .exists(&RunFilter::for_identifier(identifier), status)
            .await?)
    }

    /// Most recent finished run for `source` and `benchmark_type` on a
    /// different git reference
    pub async fn get_previous_finished(
        &self,
        source: &str,
        benchmark_type: &str,
        excluding_git_ref: &str,
    ) -> Result<Option<RunIdentifier>, SchedulerError> {
        Ok(self
            .store
            .previous_finished(source, benchmark_type, excluding_git_ref)
            .await?
            .map(|record| record.identifier()))
    }

    /// Git reference of the most recent finished run for `source`
    pub async fn latest_finished_ref(&self, source: &str) -> Result<Option<String>, SchedulerError> {
        Ok(self
            .store
            .latest_finished_for_source(source)
            .await?
            .map(|record| record.git_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryRunStore, RunRecord};
    use crate::run::RunError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    /// Fails the first `failures` attempts, then succeeds
    struct FlakyExecutor {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyExecutor {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RunExecutor for FlakyExecutor {
        async fn execute(&self, _identifier: &RunIdentifier, _config: &Path) -> Result<(), RunError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(RunError::RunFailed(format!("attempt {call}")))
            } else {
                Ok(())
            }
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl RunExecutor for PanickingExecutor {
        async fn execute(&self, _identifier: &RunIdentifier, _config: &Path) -> Result<(), RunError> {
            panic!("executor bug")
        }
    }

    /// Succeeds after sleeping for `duration`
    struct SlowExecutor {
        duration: Duration,
        completed: AtomicU32,
    }

    impl SlowExecutor {
        fn new(duration: Duration) -> Arc<Self> {
            Arc::new(Self {
                duration,
                completed: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RunExecutor for SlowExecutor {
        async fn execute(&self, _identifier: &RunIdentifier, _config: &Path) -> Result<(), RunError> {
            tokio::time::sleep(self.duration).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scheduler(executor: Arc<dyn RunExecutor>, max: usize) -> (Arc<Scheduler>, Arc<InMemoryRunStore>) {
        let store = Arc::new(InMemoryRunStore::new());
        let scheduler = Scheduler::new(
            SchedulerConfig::default().with_max_concurrent_jobs(max),
            store.clone(),
            executor,
            None,
        );
        (scheduler, store)
    }

    fn request(git_ref: &str) -> SubmitRequest {
        SubmitRequest::new(RunIdentifier::new("cron", git_ref, "micro"), "benchrun.toml")
    }

    #[tokio::test]
    async fn test_duplicate_while_queued() {
        let (scheduler, _store) = scheduler(FlakyExecutor::new(0), 1);

        assert_eq!(scheduler.submit(request("aaa")).await.unwrap(), Submission::Accepted);
        assert_eq!(
            scheduler.submit(request("aaa")).await.unwrap(),
            Submission::Duplicate(DuplicateReason::Queued)
        );
        assert_eq!(scheduler.len(), 1);

        // Still a duplicate once executing
        scheduler.try_dispatch_one().unwrap();
        assert_eq!(
            scheduler.submit(request("aaa")).await.unwrap(),
            Submission::Duplicate(DuplicateReason::Queued)
        );
    }

    #[tokio::test]
    async fn test_duplicate_of_finished_run() {
        let (scheduler, store) = scheduler(FlakyExecutor::new(0), 1);
        let identifier = RunIdentifier::new("cron", "aaa", "micro").with_planner_version("Gen4");

        let id = Uuid::now_v7();
        store.insert(&RunRecord::created(id, &identifier)).await.unwrap();
        store.update_status(id, RunStatus::Finished, Utc::now()).await.unwrap();

        // Micro lookups ignore the planner version
        let other_planner = RunIdentifier::new("cron", "aaa", "micro").with_planner_version("V3");
        assert_eq!(
            scheduler
                .submit(SubmitRequest::new(other_planner, "b.toml"))
                .await
                .unwrap(),
            Submission::Duplicate(DuplicateReason::AlreadyFinished)
        );
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_respects_ceiling() {
        let (scheduler, _store) = scheduler(FlakyExecutor::new(0), 2);
        for git_ref in ["a", "b", "c"] {
            scheduler.submit(request(git_ref)).await.unwrap();
        }

        let first = scheduler.try_dispatch_one().unwrap();
        let second = scheduler.try_dispatch_one().unwrap();
        assert_ne!(first.identifier, second.identifier);
        assert!(first.executing && second.executing);
        assert!(scheduler.try_dispatch_one().is_none());
        assert_eq!(scheduler.in_flight(), 2);
        assert_eq!(scheduler.len(), 3);
    }

    #[tokio::test]
    async fn test_dispatch_in_submission_order() {
        let (scheduler, _store) = scheduler(FlakyExecutor::new(0), 3);
        for git_ref in ["c", "a", "b"] {
            scheduler.submit(request(git_ref)).await.unwrap();
        }

        let order: Vec<String> = std::iter::from_fn(|| scheduler.try_dispatch_one())
            .map(|e| e.identifier.git_ref)
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_retry_until_exhausted() {
        let executor = FlakyExecutor::new(u32::MAX);
        let (scheduler, _store) = scheduler(executor.clone(), 1);
        scheduler.submit(request("aaa").with_retry(2)).await.unwrap();

        let element = scheduler.try_dispatch_one().unwrap();
        let (_tx, rx) = watch::channel(false);
        let outcome = scheduler.execute_element(element, rx).await;

        assert_eq!(outcome, ElementOutcome::Exhausted { attempts: 3 });
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let executor = FlakyExecutor::new(1);
        let (scheduler, _store) = scheduler(executor.clone(), 1);
        scheduler.submit(request("aaa").with_retry(2)).await.unwrap();

        let element = scheduler.try_dispatch_one().unwrap();
        let (_tx, rx) = watch::channel(false);
        let outcome = scheduler.execute_element(element, rx).await;

        assert_eq!(outcome, ElementOutcome::Succeeded { attempts: 2 });
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_zero_retry_budget_single_attempt() {
        let executor = FlakyExecutor::new(u32::MAX);
        let (scheduler, _store) = scheduler(executor.clone(), 1);
        scheduler.submit(request("aaa").with_retry(0)).await.unwrap();

        let element = scheduler.try_dispatch_one().unwrap();
        let (_tx, rx) = watch::channel(false);
        let outcome = scheduler.execute_element(element, rx).await;
        assert_eq!(outcome, ElementOutcome::Exhausted { attempts: 1 });
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_attempt_counts_as_failure() {
        let (scheduler, _store) = scheduler(Arc::new(PanickingExecutor), 1);
        scheduler.submit(request("aaa").with_retry(1)).await.unwrap();

        let element = scheduler.try_dispatch_one().unwrap();
        let (_tx, rx) = watch::channel(false);
        let outcome = scheduler.execute_element(element, rx).await;
        assert_eq!(outcome, ElementOutcome::Exhausted { attempts: 2 });
        assert_eq!(scheduler.in_flight(), 0);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_drains_queue() {
        let (scheduler, _store) = scheduler(FlakyExecutor::new(0), 1);
        for git_ref in ["a", "b", "c"] {
            scheduler.submit(request(git_ref)).await.unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.clone().run(rx));

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(scheduler.in_flight() <= 1);
            if scheduler.is_empty() {
                break;
            }
        }
        assert!(scheduler.is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_previous_finished_lookup() {
        let (scheduler, store) = scheduler(FlakyExecutor::new(0), 1);
        let older = RunIdentifier::new("cron", "old", "oltp");
        let id = Uuid::now_v7();
        store.insert(&RunRecord::created(id, &older)).await.unwrap();
        store.update_status(id, RunStatus::Started, Utc::now()).await.unwrap();
        store.update_status(id, RunStatus::Finished, Utc::now()).await.unwrap();

        let previous = scheduler
            .get_previous_finished("cron", "oltp", "new")
            .await
            .unwrap();
        assert_eq!(previous, Some(older));
        assert_eq!(
            scheduler.get_previous_finished("cron", "oltp", "old").await.unwrap(),
            None
        );
        assert_eq!(
            scheduler.latest_finished_ref("cron").await.unwrap().as_deref(),
            Some("old")
        );
        assert!(!scheduler
            .exists(&RunIdentifier::new("cron", "zzz", "oltp"), RunStatus::Finished)
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_dispatch_interval_still_dispatches() {
        let config = SchedulerConfig {
            dispatch_interval: Duration::ZERO,
            ..SchedulerConfig::default()
        };
        let store = Arc::new(InMemoryRunStore::new());
        let scheduler = Scheduler::new(config, store, FlakyExecutor::new(0), None);
        scheduler.submit(request("aaa")).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_running_element() {
        let executor = SlowExecutor::new(Duration::from_secs(10));
        let (scheduler, _store) = scheduler(executor.clone(), 1);
        scheduler.submit(request("aaa")).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(scheduler.in_flight(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(executor.completed.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_grace_bounds_the_wait() {
        let executor = SlowExecutor::new(Duration::from_secs(3600));
        let store = Arc::new(InMemoryRunStore::new());
        let scheduler = Scheduler::new(
            SchedulerConfig::default().with_shutdown_grace(Duration::from_secs(5)),
            store,
            executor.clone(),
            None,
        );
        scheduler.submit(request("aaa")).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(executor.completed.load(Ordering::SeqCst), 0);
    }
}
