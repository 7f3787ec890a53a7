use std::fs;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

use super::*;
use crate::cache::CacheRetention;
use crate::error::{ConfigError, Interrupted};
use crate::events::{EventKind, EventLog};
use crate::history::RecordedOutcome;
use crate::outcome::{BuildResult, SkipReason, TaskOutcome};
use crate::task::{ActionResult, InputProperty, TaskContext, TaskNode};

struct Project {
    _tmp: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Project {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/Main.java"), "class Main {}").unwrap();
        fs::write(root.join("src/Util.java"), "class Util {}").unwrap();
        Self { _tmp: tmp, root }
    }

    fn out(&self) -> Utf8PathBuf {
        self.root.join("build/app.txt")
    }

    fn engine(&self, history: &str, log: &Arc<EventLog>) -> Engine {
        Engine::builder()
            .config(ExecutionConfig::default().parallelism(2))
            .history_dir(self.root.join(history))
            .unwrap()
            .listener(log.clone())
            .build()
    }

    /// Concatenates every source file into `build/app.txt`.
    fn compile(&self, runs: &Arc<AtomicUsize>) -> TaskNode {
        let runs = runs.clone();
        TaskNode::new(":compile")
            .implementation("concat@1")
            .input(InputProperty::directory("sources", self.root.join("src")))
            .output_file("out", self.out())
            .run(move |ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                concat(ctx).into()
            })
    }
}

fn concat(ctx: &TaskContext<'_>) -> anyhow::Result<()> {
    let mut text = String::new();
    for file in ctx.input_files("sources")? {
        text.push_str(&fs::read_to_string(file)?);
    }

    let out = ctx.output("out").context("no output")?;
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(out, text)?;
    Ok(())
}

fn graph(tasks: impl IntoIterator<Item = TaskNode>) -> WorkGraph {
    let mut graph = WorkGraph::new();
    for task in tasks {
        graph.add_node(task).unwrap();
    }
    graph
}

fn ok() -> impl Fn(&TaskContext<'_>) -> ActionResult + Send + Sync + 'static {
    |_| ActionResult::Continue
}

fn started_reasons(log: &EventLog, task: &str) -> Vec<String> {
    log.kinds_for(task)
        .into_iter()
        .filter_map(|kind| match kind {
            EventKind::Started { reasons } => Some(reasons),
            _ => None,
        })
        .last()
        .unwrap_or_default()
}

fn mtime(path: &Utf8Path) -> std::time::SystemTime {
    fs::metadata(path).unwrap().modified().unwrap()
}

#[test]
fn test_second_build_is_up_to_date() {
    let project = Project::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(EventLog::new());
    let engine = project.engine("history", &log);

    let first = engine.run(graph([project.compile(&runs)])).unwrap();
    assert_eq!(first.outcome(":compile"), Some(&TaskOutcome::Succeeded));
    let written = mtime(&project.out());

    let second = engine.run(graph([project.compile(&runs)])).unwrap();
    assert_eq!(second.outcome(":compile"), Some(&TaskOutcome::UpToDate));
    assert!(second.is_success());
    assert_eq!(second.counts.up_to_date, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(mtime(&project.out()), written);

    assert_eq!(
        log.kinds_for(":compile").last(),
        Some(&EventKind::UpToDate)
    );
}

#[test]
fn test_changed_source_names_property() {
    let project = Project::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(EventLog::new());
    let engine = project.engine("history", &log);

    engine.run(graph([project.compile(&runs)])).unwrap();
    fs::write(project.root.join("src/Util.java"), "class Util { int x; }").unwrap();

    let outcome = engine.run(graph([project.compile(&runs)])).unwrap();
    assert_eq!(outcome.outcome(":compile"), Some(&TaskOutcome::Succeeded));
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    let reasons = started_reasons(&log, ":compile");
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].contains("'sources'"), "{reasons:?}");
    assert!(reasons[0].contains("Util.java"), "{reasons:?}");
}

#[test]
fn test_tampered_output_reruns() {
    let project = Project::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(EventLog::new());
    let engine = project.engine("history", &log);

    engine.run(graph([project.compile(&runs)])).unwrap();
    fs::write(project.out(), "edited by hand").unwrap();

    let outcome = engine.run(graph([project.compile(&runs)])).unwrap();
    assert_eq!(outcome.outcome(":compile"), Some(&TaskOutcome::Succeeded));
    assert_eq!(
        started_reasons(&log, ":compile"),
        ["Output property 'out' has been modified outside of the build"]
    );
    assert_eq!(
        fs::read_to_string(project.out()).unwrap(),
        "class Main {}class Util {}"
    );
}

#[test]
fn test_outputs_restored_from_cache() {
    let project = Project::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(EventLog::new());
    let cache = project.root.join("cache");

    let first = Engine::builder()
        .history_dir(project.root.join("history-a"))
        .unwrap()
        .local_cache_dir(&cache)
        .unwrap()
        .listener(log.clone())
        .build();
    let outcome = first
        .run(graph([project.compile(&runs).cacheable(true)]))
        .unwrap();
    assert_eq!(outcome.outcome(":compile"), Some(&TaskOutcome::Succeeded));

    fs::remove_dir_all(project.root.join("build")).unwrap();

    // Fresh history, so only the cache can save the execution.
    let second = Engine::builder()
        .history_dir(project.root.join("history-b"))
        .unwrap()
        .local_cache_dir(&cache)
        .unwrap()
        .listener(log.clone())
        .build();
    let outcome = second
        .run(graph([project.compile(&runs).cacheable(true)]))
        .unwrap();

    assert_eq!(outcome.outcome(":compile"), Some(&TaskOutcome::FromCache));
    assert_eq!(outcome.counts.from_cache, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        fs::read_to_string(project.out()).unwrap(),
        "class Main {}class Util {}"
    );

    // The restored state is now remembered as history.
    let third = second
        .run(graph([project.compile(&runs).cacheable(true)]))
        .unwrap();
    assert_eq!(third.outcome(":compile"), Some(&TaskOutcome::UpToDate));
}

#[test]
fn test_not_cacheable_task_is_not_restored() {
    let project = Project::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let cache = project.root.join("cache");
    let log = Arc::new(EventLog::new());

    for history in ["history-a", "history-b"] {
        let engine = Engine::builder()
            .history_dir(project.root.join(history))
            .unwrap()
            .local_cache_dir(&cache)
            .unwrap()
            .listener(log.clone())
            .build();
        let outcome = engine.run(graph([project.compile(&runs)])).unwrap();
        assert_eq!(outcome.outcome(":compile"), Some(&TaskOutcome::Succeeded));
    }

    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_cycle_rejected_before_execution() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();

    let graph = graph([
        TaskNode::new("a").depends_on("b").run(move |_| {
            flag.store(true, Ordering::SeqCst);
            ActionResult::Continue
        }),
        TaskNode::new("b").depends_on("c").run(ok()),
        TaskNode::new("c").depends_on("a").run(ok()),
    ]);

    let err = Engine::new(ExecutionConfig::default()).run(graph).unwrap_err();
    match err {
        EngineError::Config(ConfigError::Cycle(path)) => {
            assert_eq!(path.len(), 4);
            assert_eq!(path.first(), path.last());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!ran.load(Ordering::SeqCst));
}

fn failing_chain() -> Vec<TaskNode> {
    vec![
        TaskNode::new("a").run(|_| ActionResult::fail(anyhow::anyhow!("compilation failed"))),
        TaskNode::new("b").depends_on("a").run(ok()),
        TaskNode::new("c").depends_on("b").run(ok()),
        TaskNode::new("d").run(ok()),
    ]
}

#[test]
fn test_fail_fast_skips_dependents() {
    let config = ExecutionConfig::default().parallelism(1);
    let outcome = Engine::new(config).run(graph(failing_chain())).unwrap();

    assert_eq!(outcome.result, BuildResult::Failure);
    assert_eq!(outcome.exit_code(), 1);
    assert!(outcome.outcome("a").is_some_and(TaskOutcome::is_failure));
    assert_eq!(
        outcome.outcome("b"),
        Some(&TaskOutcome::Skipped {
            reason: SkipReason::DependencyFailed("a".into())
        })
    );
    assert_eq!(
        outcome.outcome("c"),
        Some(&TaskOutcome::Skipped {
            reason: SkipReason::DependencyFailed("b".into())
        })
    );
    assert_eq!(outcome.failures.len(), 1);
    assert!(outcome.failures[0].cause.contains("compilation failed"));
}

#[test]
fn test_failure_skips_every_dependent() {
    for config in [
        ExecutionConfig::default(),
        ExecutionConfig::default().continue_on_failure(),
    ] {
        let graph = graph([
            TaskNode::new("a").run(|_| ActionResult::fail(anyhow::anyhow!("compilation failed"))),
            TaskNode::new("b").depends_on("a").run(ok()),
            TaskNode::new("c").depends_on("a").run(ok()),
        ]);

        let outcome = Engine::new(config.parallelism(1)).run(graph).unwrap();
        assert_eq!(outcome.result, BuildResult::Failure);
        for dependent in ["b", "c"] {
            assert_eq!(
                outcome.outcome(dependent),
                Some(&TaskOutcome::Skipped {
                    reason: SkipReason::DependencyFailed("a".into())
                })
            );
        }
        assert_eq!(outcome.counts.skipped, 2);
    }
}

#[test]
fn test_continue_on_failure_runs_independent_tasks() {
    let config = ExecutionConfig::default().parallelism(1).continue_on_failure();
    let outcome = Engine::new(config).run(graph(failing_chain())).unwrap();

    assert_eq!(outcome.result, BuildResult::Failure);
    assert_eq!(outcome.outcome("d"), Some(&TaskOutcome::Succeeded));
    assert!(matches!(
        outcome.outcome("c"),
        Some(TaskOutcome::Skipped { .. })
    ));
    assert_eq!(outcome.counts.failed, 1);
    assert_eq!(outcome.counts.skipped, 2);
}

/// Sleeps while tracking how many tasks are inside at once.
fn busy(
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    time: Duration,
) -> impl Fn(&TaskContext<'_>) -> ActionResult + Send + Sync + 'static {
    move |_| {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(time);
        active.fetch_sub(1, Ordering::SeqCst);
        ActionResult::Continue
    }
}

#[test]
fn test_independent_tasks_run_concurrently() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let graph = graph([
        TaskNode::new(":compile").run(ok()),
        TaskNode::new(":lint")
            .depends_on(":compile")
            .run(busy(active.clone(), peak.clone(), Duration::from_millis(200))),
        TaskNode::new(":test")
            .depends_on(":compile")
            .run(busy(active.clone(), peak.clone(), Duration::from_millis(200))),
    ]);

    let config = ExecutionConfig::default().parallelism(2);
    let outcome = Engine::new(config).run(graph).unwrap();

    assert!(outcome.is_success());
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.diagnostics.execution_times.len(), 3);
}

#[test]
fn test_parallelism_bounds_running_tasks() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks = (0..4).map(|i| {
        TaskNode::new(format!(":t{i}")).run(busy(
            active.clone(),
            peak.clone(),
            Duration::from_millis(50),
        ))
    });

    let outcome = Engine::new(ExecutionConfig::default().parallelism(1))
        .run(graph(tasks))
        .unwrap();
    assert_eq!(outcome.counts.succeeded, 4);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn test_finalizer_runs_after_failure() {
    let graph = graph([
        TaskNode::new(":integrationTest")
            .finalized_by(":stopServer")
            .run(|_| ActionResult::fail(anyhow::anyhow!("tests failed"))),
        TaskNode::new(":stopServer").run(ok()),
    ]);

    let outcome = Engine::new(ExecutionConfig::default()).run(graph).unwrap();
    assert!(
        outcome
            .outcome(":integrationTest")
            .is_some_and(TaskOutcome::is_failure)
    );
    assert_eq!(outcome.outcome(":stopServer"), Some(&TaskOutcome::Succeeded));
}

fn record(
    order: Arc<Mutex<Vec<&'static str>>>,
    name: &'static str,
) -> impl Fn(&TaskContext<'_>) -> ActionResult + Send + Sync + 'static {
    move |_| {
        order.lock().unwrap().push(name);
        ActionResult::Continue
    }
}

#[test]
fn test_must_run_after_orders_without_dependency() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let graph = graph([
        TaskNode::new("second")
            .must_run_after("first")
            .run(record(order.clone(), "second")),
        TaskNode::new("first").run(record(order.clone(), "first")),
    ]);

    let outcome = Engine::new(ExecutionConfig::default().parallelism(2))
        .run(graph)
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(*order.lock().unwrap(), ["first", "second"]);
}

fn wait_for_interrupt(ctx: &TaskContext<'_>) -> ActionResult {
    for _ in 0..500 {
        if let Err(e) = ctx.checkpoint() {
            return ActionResult::fail(e);
        }
        thread::sleep(Duration::from_millis(10));
    }
    ActionResult::Continue
}

#[test]
fn test_timeout_interrupts_only_that_task() {
    let graph = graph([
        TaskNode::new(":hang")
            .timeout(Duration::from_millis(100))
            .run(wait_for_interrupt),
        TaskNode::new(":sibling").run(|_| {
            thread::sleep(Duration::from_millis(300));
            ActionResult::Continue
        }),
    ]);

    let config = ExecutionConfig::default().parallelism(2).continue_on_failure();
    let outcome = Engine::new(config).run(graph).unwrap();

    match outcome.outcome(":hang") {
        Some(TaskOutcome::Failed { cause }) => assert!(cause.contains("timed out"), "{cause}"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(outcome.outcome(":sibling"), Some(&TaskOutcome::Succeeded));
}

#[test]
fn test_cancellation_skips_pending_tasks() {
    let engine = Engine::new(ExecutionConfig::default().parallelism(1));
    let token = engine.cancellation_token();

    let graph = graph([
        TaskNode::new("a").run(move |_| {
            token.cancel();
            ActionResult::Continue
        }),
        TaskNode::new("b").depends_on("a").run(ok()),
    ]);

    let outcome = engine.run(graph).unwrap();
    assert_eq!(outcome.result, BuildResult::Cancelled);
    assert_eq!(outcome.exit_code(), 130);
    assert_eq!(outcome.outcome("a"), Some(&TaskOutcome::Succeeded));
    assert_eq!(
        outcome.outcome("b"),
        Some(&TaskOutcome::Skipped {
            reason: SkipReason::Cancelled
        })
    );
}

#[test]
fn test_cancellation_interrupts_running_tasks() {
    let config = ExecutionConfig::default()
        .parallelism(2)
        .cancel_grace(Duration::ZERO);
    let engine = Engine::new(config);
    let token = engine.cancellation_token();

    let graph = graph([
        TaskNode::new("slow").run(wait_for_interrupt),
        TaskNode::new("trigger").run(move |_| {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
            ActionResult::Continue
        }),
    ]);

    let outcome = engine.run(graph).unwrap();
    assert_eq!(outcome.result, BuildResult::Cancelled);
    assert_ne!(outcome.outcome("slow"), Some(&TaskOutcome::Succeeded));
}

#[test]
fn test_cancellation_ends_with_its_build() {
    let engine = Engine::new(ExecutionConfig::default().parallelism(1));
    let token = engine.cancellation_token();

    let trigger = token.clone();
    let first = engine
        .run(graph([
            TaskNode::new("a").run(move |_| {
                trigger.cancel();
                ActionResult::Continue
            }),
            TaskNode::new("b").depends_on("a").run(ok()),
        ]))
        .unwrap();
    assert_eq!(first.result, BuildResult::Cancelled);
    assert!(!token.is_cancelled());

    let second = engine.run(graph([TaskNode::new("x").run(ok())])).unwrap();
    assert!(second.is_success());
    assert_eq!(second.outcome("x"), Some(&TaskOutcome::Succeeded));

    // Raised between builds, it cancels the next one only.
    token.cancel();
    let third = engine.run(graph([TaskNode::new("x").run(ok())])).unwrap();
    assert_eq!(third.result, BuildResult::Cancelled);
    assert_eq!(
        third.outcome("x"),
        Some(&TaskOutcome::Skipped {
            reason: SkipReason::Cancelled
        })
    );

    let fourth = engine.run(graph([TaskNode::new("x").run(ok())])).unwrap();
    assert!(fourth.is_success());
}

#[test]
fn test_stop_task_and_stop_action() {
    let after_stop_action = Arc::new(AtomicBool::new(false));
    let after_stop_task = Arc::new(AtomicBool::new(false));

    let (a, b) = (after_stop_action.clone(), after_stop_task.clone());
    let graph = graph([
        TaskNode::new("partial")
            .run(|_| ActionResult::StopAction)
            .run(move |_| {
                a.store(true, Ordering::SeqCst);
                ActionResult::StopTask
            })
            .run(move |_| {
                b.store(true, Ordering::SeqCst);
                ActionResult::Continue
            }),
    ]);

    let outcome = Engine::new(ExecutionConfig::default()).run(graph).unwrap();
    assert_eq!(outcome.outcome("partial"), Some(&TaskOutcome::Succeeded));
    assert!(after_stop_action.load(Ordering::SeqCst));
    assert!(!after_stop_task.load(Ordering::SeqCst));
}

#[test]
fn test_untracked_task_always_runs() {
    let project = Project::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(EventLog::new());
    let engine = project.engine("history", &log);

    for _ in 0..2 {
        let task = project.compile(&runs).untracked("publishes to a server");
        let outcome = engine.run(graph([task])).unwrap();
        assert_eq!(outcome.outcome(":compile"), Some(&TaskOutcome::Succeeded));
    }

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    let history = ExecutionHistoryStore::open(project.root.join("history")).unwrap();
    assert!(history.load(&":compile".into()).is_none());
    assert!(started_reasons(&log, ":compile")[0].starts_with("Task state is not tracked"));
}

#[test]
fn test_excluded_task_does_not_block_dependents() {
    let config = ExecutionConfig::default().skip("a");
    let graph = graph([
        TaskNode::new("a").run(|_| ActionResult::fail(anyhow::anyhow!("must not run"))),
        TaskNode::new("b").depends_on("a").run(ok()),
    ]);

    let outcome = Engine::new(config).run(graph).unwrap();
    assert!(outcome.is_success());
    assert_eq!(
        outcome.outcome("a"),
        Some(&TaskOutcome::Skipped {
            reason: SkipReason::Excluded
        })
    );
    assert_eq!(outcome.outcome("b"), Some(&TaskOutcome::Succeeded));
}

#[test]
fn test_panic_is_a_task_failure() {
    let graph = graph([
        TaskNode::new("boom").run(|_| panic!("kaboom")),
        TaskNode::new("after").depends_on("boom").run(ok()),
    ]);

    let outcome = Engine::new(ExecutionConfig::default()).run(graph).unwrap();
    match outcome.outcome("boom") {
        Some(TaskOutcome::Failed { cause }) => assert!(cause.contains("kaboom"), "{cause}"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        outcome.outcome("after"),
        Some(TaskOutcome::Skipped { .. })
    ));
}

#[test]
fn test_failed_execution_runs_again() {
    let project = Project::new();
    let log = Arc::new(EventLog::new());
    let engine = project.engine("history", &log);
    let fail = Arc::new(AtomicBool::new(true));

    let task = |fail: Arc<AtomicBool>| {
        TaskNode::new(":compile")
            .input(InputProperty::directory("sources", project.root.join("src")))
            .output_file("out", project.out())
            .run(move |ctx| {
                if fail.load(Ordering::SeqCst) {
                    return ActionResult::fail(Interrupted);
                }
                concat(ctx).into()
            })
    };

    let first = engine.run(graph([task(fail.clone())])).unwrap();
    assert!(first.outcome(":compile").is_some_and(TaskOutcome::is_failure));

    fail.store(false, Ordering::SeqCst);
    let second = engine.run(graph([task(fail.clone())])).unwrap();
    assert_eq!(second.outcome(":compile"), Some(&TaskOutcome::Succeeded));
}

#[test]
fn test_events_and_summary() {
    let log = Arc::new(EventLog::new());
    let engine = Engine::builder().listener(log.clone()).build();

    let graph = graph([TaskNode::new("a").run(ok())]).freeze().unwrap();
    let outcome = engine.execute(&graph).unwrap();

    let kinds = log.kinds_for("a");
    assert_eq!(kinds.len(), 2);
    assert!(matches!(kinds[0], EventKind::Started { .. }));
    assert_eq!(kinds[1], EventKind::Succeeded);

    let json: serde_json::Value = serde_json::from_str(&outcome.to_json().unwrap()).unwrap();
    assert_eq!(json["result"], "SUCCESS");
    assert!(outcome.render_mermaid(&graph).contains("graph LR"));
    assert!(outcome.to_string().contains("BUILD SUCCESSFUL"));
}

#[test]
fn test_unreadable_input_fails_task_and_keeps_history() {
    let project = Project::new();
    let log = Arc::new(EventLog::new());
    let engine = project.engine("history", &log);
    let manifest = project.root.join("build.conf");
    fs::write(&manifest, "release = true").unwrap();

    let tasks = || {
        let out = project.out();
        [
            TaskNode::new(":compile")
                .input(InputProperty::file("manifest", &manifest))
                .output_file("out", project.out())
                .run(move |_| {
                    let write = || -> anyhow::Result<()> {
                        fs::create_dir_all(out.parent().context("no parent")?)?;
                        fs::write(&out, "app")?;
                        Ok(())
                    };
                    write().into()
                }),
            TaskNode::new(":package").depends_on(":compile").run(ok()),
        ]
    };

    let first = engine.run(graph(tasks())).unwrap();
    assert!(first.is_success());

    let history = ExecutionHistoryStore::open(project.root.join("history")).unwrap();
    let recorded = history.load(&":compile".into()).unwrap();

    fs::remove_file(&manifest).unwrap();
    let second = engine.run(graph(tasks())).unwrap();

    assert_eq!(second.result, BuildResult::Failure);
    match second.outcome(":compile") {
        Some(TaskOutcome::Failed { cause }) => {
            assert!(cause.contains("'manifest' does not exist"), "{cause}")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        second.outcome(":package"),
        Some(&TaskOutcome::Skipped {
            reason: SkipReason::DependencyFailed(":compile".into())
        })
    );
    assert_eq!(history.load(&":compile".into()), Some(recorded));
}

#[cfg(target_os = "linux")]
#[test]
fn test_unreadable_outputs_keep_history() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let project = Project::new();
    let log = Arc::new(EventLog::new());
    let engine = project.engine("history", &log);
    let classes = project.root.join("build/classes");
    let stray = Arc::new(AtomicBool::new(false));

    let task = || {
        let (classes, stray) = (classes.clone(), stray.clone());
        TaskNode::new(":compile")
            .input(InputProperty::directory("sources", project.root.join("src")))
            .output_dir("classes", classes.clone())
            .run(move |_| {
                let write = || -> anyhow::Result<()> {
                    fs::create_dir_all(&classes)?;
                    fs::write(classes.join("Main.class"), "main")?;
                    if stray.load(Ordering::SeqCst) {
                        let name = OsStr::from_bytes(b"\xff.class");
                        fs::write(classes.as_std_path().join(name), "stray")?;
                    }
                    Ok(())
                };
                write().into()
            })
    };

    let first = engine.run(graph([task()])).unwrap();
    assert_eq!(first.outcome(":compile"), Some(&TaskOutcome::Succeeded));

    let history = ExecutionHistoryStore::open(project.root.join("history")).unwrap();
    let recorded = history.load(&":compile".into()).unwrap();
    assert_eq!(recorded.outcome, RecordedOutcome::Succeeded);

    fs::write(project.root.join("src/Util.java"), "class Util { int x; }").unwrap();
    stray.store(true, Ordering::SeqCst);
    let second = engine.run(graph([task()])).unwrap();

    match second.outcome(":compile") {
        Some(TaskOutcome::Failed { cause }) => {
            assert!(cause.contains("Output property 'classes'"), "{cause}")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(history.load(&":compile".into()), Some(recorded));
}

#[test]
fn test_cache_evicted_after_build() {
    let project = Project::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let cache = project.root.join("cache");

    let engine = Engine::builder()
        .config(ExecutionConfig::default().cache_retention(CacheRetention {
            max_age: None,
            max_size: Some(0),
        }))
        .local_cache_dir(&cache)
        .unwrap()
        .build();

    let outcome = engine
        .run(graph([project.compile(&runs).cacheable(true)]))
        .unwrap();
    assert_eq!(outcome.outcome(":compile"), Some(&TaskOutcome::Succeeded));

    let entries = fs::read_dir(&cache)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "cbor"))
        .count();
    assert_eq!(entries, 0);
}
