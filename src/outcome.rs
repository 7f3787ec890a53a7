//! What a build did, per task and as a whole.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::time::Duration;

use console::style;
use serde::Serialize;

use crate::core::{BuildId, TaskId};
use crate::engine::Diagnostics;
use crate::graph::FrozenGraph;
use crate::utils::as_overhead;

/// Why a task did not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The task was excluded from this build. Its dependents still run.
    Excluded,
    /// A task this one depends on failed or was itself skipped.
    DependencyFailed(TaskId),
    /// Another task failed and the build stopped starting new work.
    BuildAborted,
    /// The build was cancelled before the task started.
    Cancelled,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Excluded => f.write_str("excluded from the build"),
            SkipReason::DependencyFailed(dep) => write!(f, "dependency '{dep}' did not succeed"),
            SkipReason::BuildAborted => f.write_str("build stopped after a failure"),
            SkipReason::Cancelled => f.write_str("build was cancelled"),
        }
    }
}

/// Terminal state of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    UpToDate,
    FromCache,
    Succeeded,
    Failed { cause: String },
    Skipped { reason: SkipReason },
}

impl TaskOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failed { .. })
    }

    /// Whether dependents of a task with this outcome may run.
    pub(crate) fn unblocks_dependents(&self) -> bool {
        match self {
            TaskOutcome::UpToDate | TaskOutcome::FromCache | TaskOutcome::Succeeded => true,
            TaskOutcome::Skipped { reason } => *reason == SkipReason::Excluded,
            TaskOutcome::Failed { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    Success,
    Failure,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub up_to_date: usize,
    pub from_cache: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl OutcomeCounts {
    pub(crate) fn add(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::UpToDate => self.up_to_date += 1,
            TaskOutcome::FromCache => self.from_cache += 1,
            TaskOutcome::Succeeded => self.succeeded += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
            TaskOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.up_to_date + self.from_cache + self.succeeded + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub task: TaskId,
    pub cause: String,
}

/// The summary of one build invocation.
#[derive(Debug, Serialize)]
pub struct BuildOutcome {
    pub build_id: BuildId,
    pub result: BuildResult,
    pub tasks: BTreeMap<TaskId, TaskOutcome>,
    pub counts: OutcomeCounts,
    pub elapsed: Duration,
    /// The first failures, one per task, in the order they happened.
    pub failures: Vec<TaskFailure>,
    /// Failures left out of `failures` to keep the summary short.
    pub omitted_failures: usize,
    #[serde(skip)]
    pub diagnostics: Diagnostics,
}

impl BuildOutcome {
    pub(crate) fn new(
        build_id: BuildId,
        cancelled: bool,
        tasks: BTreeMap<TaskId, TaskOutcome>,
        failure_order: Vec<TaskFailure>,
        max_reported_failures: usize,
        elapsed: Duration,
        diagnostics: Diagnostics,
    ) -> Self {
        let mut counts = OutcomeCounts::default();
        for outcome in tasks.values() {
            counts.add(outcome);
        }

        let mut failures: Vec<TaskFailure> = Vec::new();
        for failure in failure_order {
            if !failures.iter().any(|f| f.task == failure.task) {
                failures.push(failure);
            }
        }
        let omitted_failures = failures.len().saturating_sub(max_reported_failures);
        failures.truncate(max_reported_failures);

        let result = if cancelled {
            BuildResult::Cancelled
        } else if counts.failed > 0 {
            BuildResult::Failure
        } else {
            BuildResult::Success
        };

        Self {
            build_id,
            result,
            tasks,
            counts,
            elapsed,
            failures,
            omitted_failures,
            diagnostics,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == BuildResult::Success
    }

    pub fn outcome(&self, task: &str) -> Option<&TaskOutcome> {
        self.tasks.get(task)
    }

    /// Process exit status for this build.
    pub fn exit_code(&self) -> i32 {
        match self.result {
            BuildResult::Success => 0,
            BuildResult::Failure => 1,
            BuildResult::Cancelled => 130,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the graph as a Mermaid diagram coloured by outcome.
    pub fn render_mermaid(&self, graph: &FrozenGraph) -> String {
        self.diagnostics.render_mermaid(graph, &self.tasks)
    }
}

impl Display for BuildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headline = match self.result {
            BuildResult::Success => style("BUILD SUCCESSFUL").green().bold(),
            BuildResult::Failure => style("BUILD FAILED").red().bold(),
            BuildResult::Cancelled => style("BUILD CANCELLED").yellow().bold(),
        };
        writeln!(f, "{headline} {}", as_overhead(self.elapsed))?;

        let c = &self.counts;
        writeln!(
            f,
            "{} tasks: {} executed, {} up-to-date, {} from cache, {} failed, {} skipped",
            c.total(),
            c.succeeded,
            c.up_to_date,
            c.from_cache,
            c.failed,
            c.skipped
        )?;

        for failure in &self.failures {
            writeln!(f, "{} {}", style("*").red(), style(&failure.task).bold())?;
            for line in failure.cause.lines() {
                writeln!(f, "    {line}")?;
            }
        }

        if self.omitted_failures > 0 {
            writeln!(f, "... and {} more failures", self.omitted_failures)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(cancelled: bool, failures: Vec<TaskFailure>, max: usize) -> BuildOutcome {
        let mut tasks = BTreeMap::new();
        tasks.insert(TaskId::new("ok"), TaskOutcome::UpToDate);
        for failure in &failures {
            tasks.insert(
                failure.task.clone(),
                TaskOutcome::Failed {
                    cause: failure.cause.clone(),
                },
            );
        }

        BuildOutcome::new(
            BuildId::new("b"),
            cancelled,
            tasks,
            failures,
            max,
            Duration::from_millis(5),
            Diagnostics::default(),
        )
    }

    fn failure(task: &str, cause: &str) -> TaskFailure {
        TaskFailure {
            task: task.into(),
            cause: cause.into(),
        }
    }

    #[test]
    fn test_only_up_to_date_is_success() {
        let outcome = outcome(false, vec![], 10);
        assert!(outcome.is_success());
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.counts.up_to_date, 1);
    }

    #[test]
    fn test_failures_are_deduplicated_and_capped() {
        let outcome = outcome(
            false,
            vec![
                failure("a", "boom"),
                failure("a", "boom again"),
                failure("b", "bang"),
                failure("c", "crash"),
            ],
            2,
        );

        assert_eq!(outcome.result, BuildResult::Failure);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(outcome.failures, [failure("a", "boom"), failure("b", "bang")]);
        assert_eq!(outcome.omitted_failures, 1);

        let summary = outcome.to_string();
        assert!(summary.contains("BUILD FAILED"));
        assert!(summary.contains("boom"));
        assert!(summary.contains("and 1 more failures"));
    }

    #[test]
    fn test_cancelled_wins() {
        let outcome = outcome(true, vec![failure("a", "interrupted")], 10);
        assert_eq!(outcome.result, BuildResult::Cancelled);
        assert_eq!(outcome.exit_code(), 130);
    }

    #[test]
    fn test_json_summary() {
        let json = outcome(false, vec![failure("a", "boom")], 10).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["result"], "FAILURE");
        assert_eq!(value["tasks"]["a"]["outcome"], "failed");
        assert_eq!(value["counts"]["failed"], 1);
    }
}
