//! The per-task pipeline run on worker threads.
//!
//! Every task goes through the same fixed sequence: fingerprint inputs, look
//! up history, decide, and then either restore from the cache or run the
//! actions, snapshot outputs and record history. The sequence is split in two
//! jobs so that only the second one occupies an execution slot.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::{CacheKey, OutputBundle, ResultCache};
use crate::core::BuildId;
use crate::engine::checker::{self, CheckState};
use crate::error::{Interrupted, TaskError};
use crate::fingerprint::{Fingerprint, InputFingerprints, fingerprint_inputs, snapshot_outputs};
use crate::history::{ExecutionHistoryRecord, ExecutionHistoryStore, OriginMetadata, RecordedOutcome};
use crate::task::{ActionResult, Interrupt, InterruptCause, TaskContext, TaskNode};

/// Everything a task's pipeline needs, passed from stage to stage instead of
/// living in globals.
pub(crate) struct WorkContext<'a> {
    pub task: &'a TaskNode,
    pub build_id: &'a BuildId,
    pub history: Option<&'a ExecutionHistoryStore>,
    pub cache: &'a ResultCache,
    /// Set while outputs are being restored from or stored into the cache.
    pub in_cache_operation: bool,
}

/// State handed from the check job to the execute job.
pub(crate) struct PendingExecution {
    /// `None` for untracked tasks.
    pub inputs: Option<InputFingerprints>,
    pub key: Option<CacheKey>,
    pub reasons: Vec<String>,
}

pub(crate) enum CheckResult {
    UpToDate,
    FromCache,
    Execute(PendingExecution),
    Failed(TaskError),
}

pub(crate) struct ExecuteResult {
    pub result: Result<(), TaskError>,
    pub start: Instant,
    pub duration: Duration,
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

impl WorkContext<'_> {
    /// Fingerprints, consults history and, for out-of-date tasks, the cache.
    pub(crate) fn check(&mut self) -> CheckResult {
        match catch_unwind(AssertUnwindSafe(|| self.check_inner())) {
            Ok(result) => result,
            Err(panic) => CheckResult::Failed(TaskError::Panicked(panic_message(panic))),
        }
    }

    fn check_inner(&mut self) -> CheckResult {
        let task = self.task;

        if task.reason_not_to_track_state().is_some() {
            let reasons = match checker::check(task, None, None) {
                CheckState::OutOfDate(reasons) => reasons,
                _ => Vec::new(),
            };
            return CheckResult::Execute(PendingExecution {
                inputs: None,
                key: None,
                reasons,
            });
        }

        let inputs = match fingerprint_inputs(task) {
            Ok(inputs) => inputs,
            Err(e) => return CheckResult::Failed(TaskError::Fingerprint(e)),
        };

        let previous = self.history.and_then(|history| history.load(&task.id));

        let reasons = match checker::check(task, Some(&inputs), previous.as_ref()) {
            CheckState::UpToDate => return CheckResult::UpToDate,
            CheckState::OutOfDate(reasons) => reasons,
            CheckState::NotChecked | CheckState::FromCache => Vec::new(),
        };

        let key = match task.reason_not_to_cache() {
            None if self.cache.is_enabled() => Some(CacheKey::for_task(task, &inputs)),
            None => None,
            Some(reason) => {
                tracing::debug!(task = %task.id, "not caching: {reason}");
                None
            }
        };

        if let Some(key) = key
            && self.try_restore(&key, &inputs)
        {
            return CheckResult::FromCache;
        }

        CheckResult::Execute(PendingExecution {
            inputs: Some(inputs),
            key,
            reasons,
        })
    }

    /// Restores outputs from the cache and records the result in history.
    fn try_restore(&mut self, key: &CacheKey, inputs: &InputFingerprints) -> bool {
        let Some(bundle) = self.cache.load(key) else {
            return false;
        };

        self.in_cache_operation = true;
        let restored = self.restore_and_record(&bundle, inputs);
        self.in_cache_operation = false;
        restored
    }

    fn restore_and_record(&self, bundle: &OutputBundle, inputs: &InputFingerprints) -> bool {
        let task = self.task;

        if let Err(e) = bundle.restore(task) {
            tracing::warn!(task = %task.id, "couldn't restore outputs from cache: {e}");
            return false;
        }

        let outputs = match snapshot_outputs(task) {
            Ok(outputs) => outputs,
            Err(e) => {
                tracing::warn!(task = %task.id, "couldn't snapshot restored outputs: {e}");
                return false;
            }
        };

        let origin = OriginMetadata::new(
            bundle.metadata.build_id.clone(),
            bundle.metadata.execution_time,
        );
        self.record(inputs.clone(), outputs, origin, RecordedOutcome::FromCache);
        true
    }

    fn record(
        &self,
        inputs: InputFingerprints,
        outputs: BTreeMap<String, Fingerprint>,
        origin: OriginMetadata,
        outcome: RecordedOutcome,
    ) {
        let Some(history) = self.history else {
            return;
        };

        let record = ExecutionHistoryRecord {
            inputs,
            implementation: self.task.implementation_hash(),
            outputs,
            origin,
            outcome,
        };

        match history.store(&self.task.id, record) {
            Ok(()) => tracing::debug!(
                task = %self.task.id,
                cache = self.in_cache_operation,
                "recorded {outcome:?}"
            ),
            Err(e) => tracing::warn!(task = %self.task.id, "couldn't store execution history: {e}"),
        }
    }

    /// Runs the task's actions, then records outputs, history and cache.
    pub(crate) fn execute(
        &mut self,
        pending: PendingExecution,
        interrupt: &Interrupt,
        timeout: Option<Duration>,
        span: tracing::Span,
    ) -> ExecuteResult {
        let task = self.task;
        let start = Instant::now();

        let context = TaskContext {
            task,
            build: self.build_id,
            interrupt,
            span,
        };

        let mut result = match catch_unwind(AssertUnwindSafe(|| run_actions(task, &context))) {
            Ok(result) => result,
            Err(panic) => Err(TaskError::Panicked(panic_message(panic))),
        };

        match interrupt.cause() {
            Some(InterruptCause::TimedOut) => {
                result = Err(TaskError::TimedOut(timeout.unwrap_or_default()));
            }
            Some(InterruptCause::Cancelled) if result.is_err() => {
                result = Err(TaskError::Interrupted);
            }
            _ => {}
        }

        let duration = start.elapsed();

        if let Some(inputs) = pending.inputs {
            let outputs = snapshot_outputs(task);
            let origin = OriginMetadata::new(self.build_id.clone(), duration);

            match (result.is_ok(), outputs) {
                (true, Ok(outputs)) => {
                    self.record(inputs, outputs, origin, RecordedOutcome::Succeeded);
                    if let Some(key) = pending.key {
                        self.store_in_cache(&key, duration);
                    }
                }
                // keep the previous record
                (true, Err(e)) => {
                    tracing::warn!(task = %task.id, "couldn't snapshot outputs: {e}");
                    result = Err(TaskError::Fingerprint(e));
                }
                (false, outputs) => {
                    let outputs = outputs.unwrap_or_default();
                    self.record(inputs, outputs, origin, RecordedOutcome::Failed);
                }
            }
        }

        ExecuteResult {
            result,
            start,
            duration,
        }
    }

    fn store_in_cache(&mut self, key: &CacheKey, duration: Duration) {
        self.in_cache_operation = true;
        match OutputBundle::capture(self.task, self.build_id, duration) {
            Ok(bundle) => self.cache.store(key, &bundle),
            Err(e) => tracing::warn!(task = %self.task.id, "couldn't capture outputs for the cache: {e}"),
        }
        self.in_cache_operation = false;
    }
}

fn run_actions(task: &TaskNode, context: &TaskContext<'_>) -> Result<(), TaskError> {
    for action in &task.actions {
        if context.is_interrupted() {
            return Err(TaskError::Interrupted);
        }

        match action.run(context) {
            ActionResult::Continue | ActionResult::StopAction => {}
            ActionResult::StopTask => {
                tracing::debug!(task = %task.id, "stopped by action");
                break;
            }
            ActionResult::Fail(error) if error.is::<Interrupted>() => {
                return Err(TaskError::Interrupted);
            }
            ActionResult::Fail(error) => return Err(TaskError::Action(error)),
        }
    }
    Ok(())
}

/// Span shown as a spinner while a task executes.
pub(crate) fn task_span(task: &TaskNode, style: &indicatif::ProgressStyle) -> tracing::Span {
    let span = tracing::span!(Level::INFO, "task", name = task.id.as_str());
    span.pb_set_style(style);
    span.pb_set_message(&format!("Running {}", task.id));
    span
}
