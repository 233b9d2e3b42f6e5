//! Bounded-concurrency collection of task results.
//!
//! Epistemic foundation:
//! - K_i: Every admitted task ends Succeeded or Failed; one task failure never aborts the rest
//! - K_i: At most `batch_size` tasks hold an admission at once
//! - B_i: A task may fail, time out or panic → recorded as TaskFailure
//! - B_i: The backend itself may fail → halt admissions, tasks not yet admitted stay Pending
//! - I^B: Backend capacity may be lower than the batch size → shrink and retry

use super::AdmissionGate;
use crate::backend::ModelBackend;
use crate::interface::ModelInterface;
use crate::models::{
    EvalError, FailureReason, InferenceResult, Result, ResultType, Task, TaskFailure, TaskRecord,
    TaskState,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Outcome of one `collect` call.
#[derive(Debug, Default)]
pub struct Collection {
    /// Results of Succeeded tasks, in submission order
    pub results: Vec<InferenceResult>,
    pub failures: Vec<TaskFailure>,
    /// Most tasks observed in flight at once
    pub peak_in_flight: usize,
    /// First backend-level error; set when the collection halted early
    pub fatal: Option<EvalError>,
}

impl Collection {
    /// Final state of a task submitted to this collection.
    pub fn state(&self, task_id: &str) -> TaskState {
        if self.results.iter().any(|r| r.task_id() == task_id) {
            TaskState::Succeeded
        } else if self.failures.iter().any(|f| f.task_id == task_id) {
            TaskState::Failed
        } else {
            TaskState::Pending
        }
    }
}

/// Runs tasks of one result type against a backend and interface.
#[derive(Debug, Clone)]
pub struct BatchCollector {
    result_type: ResultType,
    task_timeout: Option<Duration>,
    capacity_retries: usize,
}

/// State shared by the spawned tasks of one collection.
struct TaskContext {
    result_type: ResultType,
    backend: Arc<dyn ModelBackend>,
    interface: Arc<dyn ModelInterface>,
    gate: Arc<AdmissionGate>,
    task_timeout: Option<Duration>,
    capacity_retries: usize,
    halted: AtomicBool,
}

impl BatchCollector {
    pub fn new(result_type: ResultType) -> Self {
        Self {
            result_type,
            task_timeout: None,
            capacity_retries: 2,
        }
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_capacity_retries(mut self, retries: usize) -> Self {
        self.capacity_retries = retries;
        self
    }

    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    /// Evaluate every task with at most `batch_size` in flight.
    ///
    /// Task errors land in `Collection::failures`. An error that is not
    /// task-level (dead backend, I/O) halts admissions instead: it lands in
    /// `Collection::fatal` and the tasks it stopped are neither results nor
    /// failures.
    pub async fn collect(
        &self,
        tasks: Vec<Task>,
        backend: Arc<dyn ModelBackend>,
        interface: Arc<dyn ModelInterface>,
        batch_size: usize,
    ) -> Collection {
        let gate = AdmissionGate::new(batch_size);
        let ctx = Arc::new(TaskContext {
            result_type: self.result_type,
            backend,
            interface,
            gate: Arc::clone(&gate),
            task_timeout: self.task_timeout,
            capacity_retries: self.capacity_retries,
            halted: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let ctx = Arc::clone(&ctx);
            let task_id = task.id();
            let handle = tokio::spawn(async move { ctx.run(&task).await });
            handles.push((task_id, handle));
        }

        let mut collection = Collection::default();
        for (task_id, handle) in handles {
            match handle.await {
                Ok(Ok(Some(result))) => collection.results.push(result),
                Ok(Ok(None)) => {}
                Ok(Err(e)) if !e.is_task_level() => {
                    if collection.fatal.is_none() {
                        error!(task_id = %task_id, error = %e, "Backend failed, halting collection");
                        collection.fatal = Some(e);
                    }
                }
                Ok(Err(e)) => {
                    warn!(task_id = %task_id, error = %e, "Task failed");
                    collection.failures.push(TaskFailure {
                        task_id,
                        reason: e.failure_reason(),
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Task panicked");
                    collection.failures.push(TaskFailure {
                        task_id,
                        reason: FailureReason::Panicked,
                        message: e.to_string(),
                    });
                }
            }
        }

        collection.peak_in_flight = gate.peak();
        debug!(
            succeeded = collection.results.len(),
            failed = collection.failures.len(),
            halted = collection.fatal.is_some(),
            peak_in_flight = collection.peak_in_flight,
            "Collection finished"
        );
        collection
    }
}

impl TaskContext {
    /// Admit, evaluate, and retry on capacity refusals with a smaller ceiling.
    ///
    /// `Ok(None)` when the collection halted before this task ran.
    async fn run(&self, task: &Task) -> Result<Option<InferenceResult>> {
        let mut attempt = 0;
        loop {
            let admission = self.gate.admit().await?;
            if self.halted.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let outcome = self.evaluate_with_timeout(task).await;
            if matches!(&outcome, Err(e) if !e.is_task_level()) {
                self.halted.store(true, Ordering::SeqCst);
            }
            let observed = admission.capacity();
            drop(admission);

            match outcome {
                Err(EvalError::CapacityExceeded(reason)) if attempt < self.capacity_retries => {
                    attempt += 1;
                    let capacity = self.gate.shrink_from(observed).await?;
                    debug!(task_id = %task.id(), attempt, capacity, %reason, "Retrying after capacity refusal");
                }
                other => return other.map(Some),
            }
        }
    }

    async fn evaluate_with_timeout(&self, task: &Task) -> Result<InferenceResult> {
        match self.task_timeout {
            Some(limit) => tokio::time::timeout(limit, self.evaluate(task))
                .await
                .map_err(|_| EvalError::Timeout(limit))?,
            None => self.evaluate(task).await,
        }
    }

    async fn evaluate(&self, task: &Task) -> Result<InferenceResult> {
        let backend = self.backend.as_ref();
        let interface = &self.interface;
        match (self.result_type, task) {
            (ResultType::PreferenceDirect, Task::Pair(pair)) => interface
                .judge_preference_direct(backend, pair)
                .await
                .map(InferenceResult::Comparison),
            (ResultType::PreferenceCot, Task::Pair(pair)) => interface
                .judge_preference_cot(backend, pair)
                .await
                .map(InferenceResult::Comparison),
            (ResultType::Perplexity, Task::Single(entry)) => interface
                .score_perplexity(backend, entry)
                .await
                .map(InferenceResult::Forward),
            (ResultType::Response, Task::Single(entry)) => interface
                .generate_response(backend, entry)
                .await
                .map(InferenceResult::Generation),
            (result_type, task) => Err(EvalError::InputMismatch(format!(
                "{result_type} cannot evaluate task {}",
                task.id()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::StubBackend;
    use crate::interface::{GenerationLimits, ModelFamily, create_interface};
    use crate::models::{CorrectnessLabel, Pair, Verdict, test_entry};

    fn pair_tasks(n: usize) -> Vec<Task> {
        (0..n)
            .map(|i| {
                Task::Pair(Pair {
                    entry_a: test_entry(&format!("en_{i}"), "en", CorrectnessLabel::Correct),
                    entry_b: test_entry(&format!("fr_{i}"), "fr", CorrectnessLabel::Incorrect),
                })
            })
            .collect()
    }

    fn interface() -> Arc<dyn ModelInterface> {
        create_interface(ModelFamily::ApiChat, GenerationLimits::default())
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let backend = StubBackend::new("stub").with_reply(|prompt| {
            if prompt.contains("answer en_3") {
                Ok("I cannot decide.".into())
            } else {
                Ok("Final answer: A".into())
            }
        });
        let collection = BatchCollector::new(ResultType::PreferenceCot)
            .collect(pair_tasks(6), Arc::new(backend), interface(), 3)
            .await;

        assert_eq!(collection.results.len(), 5);
        assert_eq!(collection.failures.len(), 1);
        assert_eq!(collection.failures[0].task_id, "en_3__fr_3");
        assert_eq!(collection.failures[0].reason, FailureReason::UnparseableVerdict);
        assert_eq!(collection.state("en_3__fr_3"), TaskState::Failed);
        assert_eq!(collection.state("en_0__fr_0"), TaskState::Succeeded);
        assert_eq!(collection.state("missing"), TaskState::Pending);
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_batch_size() {
        let backend = StubBackend::new("stub").with_delay(Duration::from_millis(10));
        let collection = BatchCollector::new(ResultType::PreferenceCot)
            .collect(pair_tasks(20), Arc::new(backend), interface(), 4)
            .await;

        assert_eq!(collection.results.len(), 20);
        assert!(collection.peak_in_flight <= 4);
        assert!(collection.peak_in_flight >= 1);
        let ids: Vec<&str> = collection.results.iter().map(|r| r.task_id()).collect();
        assert_eq!(ids[0], "en_0__fr_0");
        assert_eq!(ids[19], "en_19__fr_19");
    }

    #[tokio::test]
    async fn test_timeout_recorded_as_failure() {
        let backend = StubBackend::new("stub").with_delay(Duration::from_millis(200));
        let collection = BatchCollector::new(ResultType::PreferenceCot)
            .with_task_timeout(Some(Duration::from_millis(10)))
            .collect(pair_tasks(2), Arc::new(backend), interface(), 2)
            .await;

        assert!(collection.results.is_empty());
        assert_eq!(collection.failures.len(), 2);
        assert!(collection.failures.iter().all(|f| f.reason == FailureReason::Timeout));
    }

    #[tokio::test]
    async fn test_capacity_refusals_shrink_and_retry() {
        let backend = StubBackend::new("stub")
            .with_concurrency_limit(2)
            .with_delay(Duration::from_millis(10));
        let collection = BatchCollector::new(ResultType::PreferenceCot)
            .with_capacity_retries(10)
            .collect(pair_tasks(8), Arc::new(backend), interface(), 8)
            .await;

        assert_eq!(collection.failures, Vec::new());
        assert_eq!(collection.results.len(), 8);
    }

    #[tokio::test]
    async fn test_capacity_refusal_without_retries_fails_task() {
        let backend = StubBackend::new("stub").with_capacity(0);
        let collection = BatchCollector::new(ResultType::PreferenceCot)
            .with_capacity_retries(0)
            .collect(pair_tasks(1), Arc::new(backend), interface(), 1)
            .await;

        assert_eq!(collection.failures[0].reason, FailureReason::CapacityExceeded);
    }

    #[tokio::test]
    async fn test_task_kind_must_match_result_type() {
        let tasks = vec![Task::Single(test_entry("en_1", "en", CorrectnessLabel::Correct))];
        let collection = BatchCollector::new(ResultType::PreferenceDirect)
            .collect(tasks, Arc::new(StubBackend::new("stub")), interface(), 1)
            .await;

        assert_eq!(collection.failures[0].reason, FailureReason::InputMismatch);
    }

    #[tokio::test]
    async fn test_direct_and_perplexity_dispatch() {
        let backend: Arc<dyn ModelBackend> = Arc::new(StubBackend::new("stub"));

        let direct = BatchCollector::new(ResultType::PreferenceDirect)
            .collect(pair_tasks(1), Arc::clone(&backend), interface(), 1)
            .await;
        match &direct.results[0] {
            InferenceResult::Comparison(c) => assert_eq!(c.verdict, Verdict::A),
            other => panic!("unexpected result {other:?}"),
        }

        let singles = vec![Task::Single(test_entry("en_1", "en", CorrectnessLabel::Correct))];
        let perplexity = BatchCollector::new(ResultType::Perplexity)
            .collect(singles, backend, interface(), 1)
            .await;
        assert!(matches!(perplexity.results[0], InferenceResult::Forward(_)));
    }

    #[tokio::test]
    async fn test_backend_failure_halts_collection() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let backend = StubBackend::new("stub").with_reply(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(EvalError::unavailable("vllm", "HTTP 503: engine dead"))
        });
        let tasks = pair_tasks(50);
        let collection = BatchCollector::new(ResultType::PreferenceCot)
            .collect(tasks, Arc::new(backend), interface(), 2)
            .await;

        assert!(matches!(collection.fatal, Some(EvalError::BackendUnavailable { .. })));
        assert!(collection.results.is_empty());
        assert!(collection.failures.is_empty());
        assert!(calls.load(Ordering::SeqCst) <= 2);
        assert_eq!(collection.state("en_49__fr_49"), TaskState::Pending);
    }

    #[tokio::test]
    async fn test_task_failures_do_not_halt() {
        let backend = StubBackend::new("stub").with_reply(|_| Ok("no verdict here".into()));
        let collection = BatchCollector::new(ResultType::PreferenceCot)
            .collect(pair_tasks(4), Arc::new(backend), interface(), 2)
            .await;

        assert!(collection.fatal.is_none());
        assert_eq!(collection.failures.len(), 4);
    }
}
