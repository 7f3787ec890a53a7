//! The up-to-date check.
//!
//! Compares the current state of a task with what the execution history
//! remembers about it and decides whether its actions have to run. Every
//! "out of date" decision carries human readable reasons.

use std::collections::BTreeMap;

use crate::fingerprint::{Change, EntryKind, Fingerprint, InputFingerprints, snapshot_outputs};
use crate::history::{ExecutionHistoryRecord, RecordedOutcome};
use crate::task::TaskNode;

/// Upper bound on the reasons reported for one out-of-date task.
pub const MAX_REASONS: usize = 3;

/// State of a task as seen by the up-to-date check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckState {
    NotChecked,
    UpToDate,
    FromCache,
    OutOfDate(Vec<String>),
}

/// Collects reasons, keeping the first [`MAX_REASONS`].
#[derive(Default)]
struct Reasons {
    kept: Vec<String>,
    dropped: usize,
}

impl Reasons {
    fn push(&mut self, reason: String) {
        if self.kept.len() < MAX_REASONS {
            self.kept.push(reason);
        } else {
            self.dropped += 1;
        }
    }

    fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }

    fn finish(mut self) -> Vec<String> {
        if self.dropped > 0 {
            self.kept.push(format!("and {} more", self.dropped));
        }
        self.kept
    }
}

fn is_value(fingerprint: &Fingerprint) -> bool {
    fingerprint
        .entries()
        .iter()
        .any(|entry| entry.kind == EntryKind::Value)
}

fn describe_input(name: &str, current: &Fingerprint, previous: &Fingerprint, reasons: &mut Reasons) {
    if is_value(current) || is_value(previous) {
        reasons.push(format!("Value of input property '{name}' has changed"));
        return;
    }

    for change in current.changes_since(previous) {
        let reason = match change {
            Change::Modified(path) if path.is_empty() => {
                format!("Input property '{name}' has changed")
            }
            Change::Added(path) => format!("Input property '{name}' file {path} has been added"),
            Change::Removed(path) => {
                format!("Input property '{name}' file {path} has been removed")
            }
            Change::Modified(path) => format!("Input property '{name}' file {path} has changed"),
        };
        reasons.push(reason);
    }
}

fn compare_inputs(current: &InputFingerprints, previous: &InputFingerprints, reasons: &mut Reasons) {
    if current.hash == previous.hash {
        return;
    }

    for (name, now) in &current.properties {
        match previous.properties.get(name) {
            None => reasons.push(format!("Input property '{name}' has been added")),
            Some(then) if then.hash() != now.hash() => describe_input(name, now, then, reasons),
            Some(_) => {}
        }
    }

    for name in previous.properties.keys() {
        if !current.properties.contains_key(name) {
            reasons.push(format!("Input property '{name}' has been removed"));
        }
    }

    if reasons.is_empty() {
        reasons.push(String::from("Input properties have changed"));
    }
}

fn compare_outputs(
    task: &TaskNode,
    previous: &BTreeMap<String, Fingerprint>,
    reasons: &mut Reasons,
) {
    let current = match snapshot_outputs(task) {
        Ok(current) => current,
        Err(e) => {
            reasons.push(format!("Outputs could not be read: {e}"));
            return;
        }
    };

    for (name, now) in &current {
        match previous.get(name) {
            Some(then) if then.hash() == now.hash() => {}
            Some(_) => reasons.push(format!(
                "Output property '{name}' has been modified outside of the build"
            )),
            None => reasons.push(format!("Output property '{name}' has been added")),
        }
    }

    for name in previous.keys() {
        if !current.contains_key(name) {
            reasons.push(format!("Output property '{name}' has been removed"));
        }
    }
}

/// Decides whether `task` is up to date with respect to `previous`.
///
/// Returns [`CheckState::UpToDate`] or [`CheckState::OutOfDate`]; whether an
/// out-of-date task can be satisfied from the build cache is decided by the
/// caller.
pub fn check(
    task: &TaskNode,
    inputs: Option<&InputFingerprints>,
    previous: Option<&ExecutionHistoryRecord>,
) -> CheckState {
    if let Some(reason) = task.reason_not_to_track_state() {
        return CheckState::OutOfDate(vec![format!("Task state is not tracked: {reason}")]);
    }

    if task.outputs.is_empty() {
        return CheckState::OutOfDate(vec![String::from("task has not declared any outputs")]);
    }

    let Some(previous) = previous else {
        return CheckState::OutOfDate(vec![String::from("no history")]);
    };

    if previous.outcome == RecordedOutcome::Failed {
        return CheckState::OutOfDate(vec![String::from("previous execution failed")]);
    }

    if previous.implementation != task.implementation_hash() {
        return CheckState::OutOfDate(vec![String::from("task implementation has changed")]);
    }

    let Some(inputs) = inputs else {
        return CheckState::OutOfDate(vec![String::from("inputs were not fingerprinted")]);
    };

    let mut reasons = Reasons::default();
    compare_inputs(inputs, &previous.inputs, &mut reasons);
    if !reasons.is_empty() {
        return CheckState::OutOfDate(reasons.finish());
    }

    compare_outputs(task, &previous.outputs, &mut reasons);
    if !reasons.is_empty() {
        return CheckState::OutOfDate(reasons.finish());
    }

    CheckState::UpToDate
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::core::BuildId;
    use crate::fingerprint::{fingerprint_inputs, snapshot_outputs};
    use crate::history::OriginMetadata;
    use crate::task::InputProperty;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
            fs::create_dir_all(root.join("src")).unwrap();
            for i in 0..5 {
                fs::write(root.join(format!("src/F{i}.java")), format!("class F{i} {{}}")).unwrap();
            }
            fs::write(root.join("out.txt"), "built").unwrap();
            Self { _tmp: tmp, root }
        }

        fn task(&self) -> TaskNode {
            TaskNode::new(":compile")
                .input(InputProperty::directory("sources", self.root.join("src")))
                .output_file("out", self.root.join("out.txt"))
        }

        fn record(&self, task: &TaskNode, outcome: RecordedOutcome) -> ExecutionHistoryRecord {
            ExecutionHistoryRecord {
                inputs: fingerprint_inputs(task).unwrap(),
                implementation: task.implementation_hash(),
                outputs: snapshot_outputs(task).unwrap(),
                origin: OriginMetadata::new(BuildId::new("b"), Duration::ZERO),
                outcome,
            }
        }
    }

    fn reasons(state: CheckState) -> Vec<String> {
        match state {
            CheckState::OutOfDate(reasons) => reasons,
            other => panic!("expected out of date, got {other:?}"),
        }
    }

    #[test]
    fn test_up_to_date() {
        let fx = Fixture::new();
        let task = fx.task();
        let record = fx.record(&task, RecordedOutcome::Succeeded);
        let inputs = fingerprint_inputs(&task).unwrap();

        assert_eq!(check(&task, Some(&inputs), Some(&record)), CheckState::UpToDate);
        assert_eq!(reasons(check(&task, Some(&inputs), None)), ["no history"]);
    }

    #[test]
    fn test_changed_input_names_property() {
        let fx = Fixture::new();
        let task = fx.task();
        let record = fx.record(&task, RecordedOutcome::Succeeded);

        fs::write(fx.root.join("src/F0.java"), "class F0 { int x; }").unwrap();
        let inputs = fingerprint_inputs(&task).unwrap();

        let reasons = reasons(check(&task, Some(&inputs), Some(&record)));
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("'sources'"));
        assert!(reasons[0].contains("F0.java"));
    }

    #[test]
    fn test_reasons_are_capped() {
        let fx = Fixture::new();
        let task = fx.task();
        let record = fx.record(&task, RecordedOutcome::Succeeded);

        for i in 0..5 {
            fs::write(fx.root.join(format!("src/F{i}.java")), "changed").unwrap();
        }
        let inputs = fingerprint_inputs(&task).unwrap();

        let reasons = reasons(check(&task, Some(&inputs), Some(&record)));
        assert_eq!(reasons.len(), MAX_REASONS + 1);
        assert_eq!(reasons[MAX_REASONS], "and 2 more");
    }

    #[test]
    fn test_tampered_output() {
        let fx = Fixture::new();
        let task = fx.task();
        let record = fx.record(&task, RecordedOutcome::Succeeded);
        let inputs = fingerprint_inputs(&task).unwrap();

        fs::remove_file(fx.root.join("out.txt")).unwrap();

        assert_eq!(
            reasons(check(&task, Some(&inputs), Some(&record))),
            ["Output property 'out' has been modified outside of the build"]
        );
    }

    #[test]
    fn test_failed_history_and_implementation_change() {
        let fx = Fixture::new();
        let task = fx.task();
        let inputs = fingerprint_inputs(&task).unwrap();

        let failed = fx.record(&task, RecordedOutcome::Failed);
        assert_eq!(
            reasons(check(&task, Some(&inputs), Some(&failed))),
            ["previous execution failed"]
        );

        let record = fx.record(&task, RecordedOutcome::Succeeded);
        let upgraded = task.implementation("javac@21");
        assert_eq!(
            reasons(check(&upgraded, Some(&inputs), Some(&record))),
            ["task implementation has changed"]
        );
    }

    #[test]
    fn test_untracked_and_outputless() {
        let fx = Fixture::new();
        let task = fx.task();
        let record = fx.record(&task, RecordedOutcome::Succeeded);
        let inputs = fingerprint_inputs(&task).unwrap();

        let untracked = task.untracked("talks to the network");
        assert!(matches!(
            check(&untracked, Some(&inputs), Some(&record)),
            CheckState::OutOfDate(_)
        ));

        let outputless = TaskNode::new(":check");
        assert_eq!(
            reasons(check(&outputless, Some(&inputs), Some(&record))),
            ["task has not declared any outputs"]
        );
    }

    #[test]
    fn test_scalar_change() {
        let task = |level: u32| {
            TaskNode::new(":a")
                .input(InputProperty::scalar("level", &level).unwrap())
                .output_file("out", "/nonexistent/out")
        };
        let before = task(1);
        let record = ExecutionHistoryRecord {
            inputs: fingerprint_inputs(&before).unwrap(),
            implementation: before.implementation_hash(),
            outputs: snapshot_outputs(&before).unwrap(),
            origin: OriginMetadata::new(BuildId::new("b"), Duration::ZERO),
            outcome: RecordedOutcome::Succeeded,
        };

        let after = task(2);
        let inputs = fingerprint_inputs(&after).unwrap();
        assert_eq!(
            reasons(check(&after, Some(&inputs), Some(&record))),
            ["Value of input property 'level' has changed"]
        );
    }
}
