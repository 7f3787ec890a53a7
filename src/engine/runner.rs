mod diagnostics;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::RequestedOutcome;
use crate::core::{BuildId, TaskId};
use crate::engine::Engine;
use crate::engine::pipeline::{self, CheckResult, ExecuteResult, PendingExecution, WorkContext};
use crate::error::EngineError;
use crate::events::{EventKind, TaskEvent};
use crate::graph::{EdgeKind, FrozenGraph};
use crate::outcome::{BuildOutcome, SkipReason, TaskFailure, TaskOutcome};
use crate::task::{Interrupt, InterruptCause};
use crate::utils::{as_overhead, get_style_build, get_style_task};

pub use diagnostics::{Diagnostics, TaskExecution};

/// Upper bound on how long the coordinator sleeps before looking at the
/// cancellation token and task deadlines again.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A completion reported by a worker.
enum Message {
    Checked(NodeIndex, CheckResult),
    Executed(NodeIndex, ExecuteResult),
}

/// Read-only state shared by every job of one build.
#[derive(Clone, Copy)]
struct Shared<'a> {
    graph: &'a FrozenGraph,
    engine: &'a Engine,
    build_id: &'a BuildId,
}

impl<'a> Shared<'a> {
    fn work(&self, index: NodeIndex) -> WorkContext<'a> {
        WorkContext {
            task: self.graph.task(index),
            build_id: self.build_id,
            history: self.engine.history.as_ref(),
            cache: &self.engine.cache,
            in_cache_operation: false,
        }
    }
}

fn spawn_check<'scope>(
    s: &rayon::Scope<'scope>,
    shared: Shared<'scope>,
    index: NodeIndex,
    sender: Sender<Message>,
) {
    s.spawn(move |_| {
        let result = shared.work(index).check();
        let _ = sender.send(Message::Checked(index, result));
    });
}

fn spawn_execute<'scope>(
    s: &rayon::Scope<'scope>,
    shared: Shared<'scope>,
    index: NodeIndex,
    job: (PendingExecution, Interrupt, Option<Duration>),
    style: ProgressStyle,
    sender: Sender<Message>,
) {
    s.spawn(move |_| {
        let (pending, interrupt, timeout) = job;
        let span = pipeline::task_span(shared.graph.task(index), &style);
        let _enter = span.enter();

        let result = shared
            .work(index)
            .execute(pending, &interrupt, timeout, span.clone());
        let _ = sender.send(Message::Executed(index, result));
    });
}

struct Running {
    interrupt: Interrupt,
    deadline: Option<Instant>,
}

/// Bookkeeping owned by the coordinating thread. Workers never touch it;
/// they only send [`Message`]s.
struct Coordinator<'a> {
    shared: Shared<'a>,
    /// Predecessors not yet in a terminal state.
    remaining: HashMap<NodeIndex, usize>,
    dependents: HashMap<NodeIndex, Vec<NodeIndex>>,
    ready: VecDeque<NodeIndex>,
    checking: usize,
    waiting: VecDeque<(NodeIndex, PendingExecution)>,
    running: HashMap<NodeIndex, Running>,
    outcomes: HashMap<NodeIndex, TaskOutcome>,
    failures: Vec<TaskFailure>,
    execution_times: HashMap<TaskId, TaskExecution>,
    aborted: bool,
    cancelled_at: Option<Instant>,
    interrupted: bool,
    root_span: tracing::Span,
}

impl<'a> Coordinator<'a> {
    fn new(shared: Shared<'a>, root_span: tracing::Span) -> Self {
        let graph = shared.graph;
        let mut remaining = HashMap::new();
        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();

        for index in graph.node_indices() {
            let before: HashSet<NodeIndex> = [
                EdgeKind::DependsOn,
                EdgeKind::MustRunAfter,
                EdgeKind::FinalizedBy,
            ]
            .into_iter()
            .flat_map(|kind| graph.predecessors(index, kind))
            .collect();

            for &predecessor in &before {
                dependents.entry(predecessor).or_default().push(index);
            }
            remaining.insert(index, before.len());
        }

        let ready = graph
            .ready_nodes(&HashSet::new(), &HashSet::new())
            .into_iter()
            .collect();

        Self {
            shared,
            remaining,
            dependents,
            ready,
            checking: 0,
            waiting: VecDeque::new(),
            running: HashMap::new(),
            outcomes: HashMap::new(),
            failures: Vec::new(),
            execution_times: HashMap::new(),
            aborted: false,
            cancelled_at: None,
            interrupted: false,
            root_span,
        }
    }

    fn emit(&self, index: NodeIndex, kind: EventKind) {
        let event = TaskEvent::new(self.shared.graph.task(index).id.clone(), kind);
        for listener in &self.shared.engine.listeners {
            listener.on_event(&event);
        }
    }

    /// Why a task that is about to start must not, if at all.
    fn blocked(&self, index: NodeIndex) -> Option<SkipReason> {
        if self.cancelled_at.is_some() {
            return Some(SkipReason::Cancelled);
        }
        if self.aborted && !self.shared.graph.is_finalizer(index) {
            return Some(SkipReason::BuildAborted);
        }
        None
    }

    /// Decides whether a task whose predecessors are all done may start.
    fn admit(&self, index: NodeIndex) -> Option<SkipReason> {
        let graph = self.shared.graph;

        for dependency in graph.predecessors(index, EdgeKind::DependsOn) {
            if let Some(outcome) = self.outcomes.get(&dependency)
                && !outcome.unblocks_dependents()
            {
                return Some(SkipReason::DependencyFailed(graph.task(dependency).id.clone()));
            }
        }

        if let Some(reason) = self.blocked(index) {
            return Some(reason);
        }

        let id = &graph.task(index).id;
        if self.shared.engine.config.requested(id) == RequestedOutcome::Skip {
            return Some(SkipReason::Excluded);
        }

        None
    }

    /// Records the terminal state of a task and releases its dependents.
    fn finish(&mut self, index: NodeIndex, outcome: TaskOutcome) {
        let kind = match &outcome {
            TaskOutcome::UpToDate => EventKind::UpToDate,
            TaskOutcome::FromCache => EventKind::FromCache,
            TaskOutcome::Succeeded => EventKind::Succeeded,
            TaskOutcome::Failed { cause } => EventKind::Failed {
                cause: cause.clone(),
            },
            TaskOutcome::Skipped { reason } => EventKind::Skipped {
                reason: reason.clone(),
            },
        };
        self.emit(index, kind);

        if let TaskOutcome::Failed { cause } = &outcome {
            self.failures.push(TaskFailure {
                task: self.shared.graph.task(index).id.clone(),
                cause: cause.clone(),
            });

            if self.shared.engine.config.fail_fast && !self.aborted {
                tracing::warn!("a task failed, no new tasks will be started");
                self.aborted = true;
            }
        }

        self.outcomes.insert(index, outcome);
        self.root_span.pb_inc(1);

        for &dependent in self.dependents.get(&index).into_iter().flatten() {
            if let Some(count) = self.remaining.get_mut(&dependent) {
                *count -= 1;
                if *count == 0 {
                    self.ready.push_back(dependent);
                }
            }
        }
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Checked(index, result) => {
                self.checking -= 1;
                match result {
                    CheckResult::UpToDate => self.finish(index, TaskOutcome::UpToDate),
                    CheckResult::FromCache => self.finish(index, TaskOutcome::FromCache),
                    CheckResult::Failed(e) => self.finish(
                        index,
                        TaskOutcome::Failed {
                            cause: e.to_string(),
                        },
                    ),
                    CheckResult::Execute(pending) => self.waiting.push_back((index, pending)),
                }
            }
            Message::Executed(index, executed) => {
                self.running.remove(&index);
                self.execution_times.insert(
                    self.shared.graph.task(index).id.clone(),
                    TaskExecution {
                        start: executed.start,
                        duration: executed.duration,
                    },
                );

                let outcome = match executed.result {
                    Ok(()) => TaskOutcome::Succeeded,
                    Err(e) => TaskOutcome::Failed {
                        cause: e.to_string(),
                    },
                };
                self.finish(index, outcome);
            }
        }
    }

    /// Looks at the cancellation token and at task deadlines.
    fn poll(&mut self) {
        let now = Instant::now();
        let engine = self.shared.engine;

        if self.cancelled_at.is_none() && engine.cancel.is_cancelled() {
            tracing::warn!(
                running = self.running.len(),
                "build cancelled, waiting for running tasks"
            );
            self.cancelled_at = Some(now);
        }

        if let Some(at) = self.cancelled_at
            && !self.interrupted
            && now.duration_since(at) >= engine.config.cancel_grace
        {
            for running in self.running.values() {
                running.interrupt.raise(InterruptCause::Cancelled);
            }
            self.interrupted = true;
        }

        for (index, running) in &self.running {
            if running.deadline.is_some_and(|deadline| now >= deadline)
                && !running.interrupt.is_raised()
            {
                tracing::warn!(task = %self.shared.graph.task(*index).id, "task timed out");
                running.interrupt.raise(InterruptCause::TimedOut);
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.ready.is_empty()
            && self.waiting.is_empty()
            && self.running.is_empty()
            && self.checking == 0
    }
}

/// Executes the work graph using a dedicated thread pool.
///
/// The calling thread becomes the coordinator. It counts, for every task, the
/// predecessors that have not reached a terminal state yet; a task whose
/// count drops to zero is either skipped right away or handed to a worker for
/// its up-to-date check. Tasks found out of date wait for one of the
/// `parallelism` execution slots. Workers report back over a channel, and the
/// coordinator updates the counts and repeats until nothing is left.
pub(crate) fn run_tasks_parallel(
    engine: &Engine,
    graph: &FrozenGraph,
) -> Result<BuildOutcome, EngineError> {
    let started = Instant::now();
    let build_id = BuildId::generate();
    let parallelism = engine.config.parallelism.max(1);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism)
        .thread_name(|i| format!("tsumiki-worker-{i}"))
        .build()?;

    let root_span = tracing::span!(Level::INFO, "building_tasks", build = %build_id);
    root_span.pb_set_length(graph.len() as u64);
    root_span.pb_set_style(&get_style_build()?);
    root_span.pb_set_message("Building tasks...");
    let _enter = root_span.enter();

    // regular task style with no progress
    let task_style = get_style_task()?;

    let shared = Shared {
        graph,
        engine,
        build_id: &build_id,
    };
    let mut state = Coordinator::new(shared, root_span.clone());

    pool.in_place_scope(|s| {
        let (sender, receiver) = channel::<Message>();

        loop {
            state.poll();

            // Settle everything that can be settled without waiting.
            loop {
                while let Some(index) = state.ready.pop_front() {
                    match state.admit(index) {
                        Some(reason) => state.finish(index, TaskOutcome::Skipped { reason }),
                        None => {
                            state.checking += 1;
                            spawn_check(s, shared, index, sender.clone());
                        }
                    }
                }

                while state.running.len() < parallelism
                    && let Some((index, pending)) = state.waiting.pop_front()
                {
                    if let Some(reason) = state.blocked(index) {
                        state.finish(index, TaskOutcome::Skipped { reason });
                        continue;
                    }

                    let timeout = graph.task(index).timeout.or(engine.config.task_timeout);
                    let interrupt = Interrupt::default();

                    state.emit(
                        index,
                        EventKind::Started {
                            reasons: pending.reasons.clone(),
                        },
                    );
                    state.running.insert(
                        index,
                        Running {
                            interrupt: interrupt.clone(),
                            deadline: timeout.map(|t| Instant::now() + t),
                        },
                    );

                    spawn_execute(
                        s,
                        shared,
                        index,
                        (pending, interrupt, timeout),
                        task_style.clone(),
                        sender.clone(),
                    );
                }

                if state.ready.is_empty() {
                    break;
                }
            }

            if state.is_idle() {
                break;
            }

            match receiver.recv_timeout(POLL_INTERVAL) {
                Ok(message) => state.handle(message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    let elapsed = started.elapsed();
    let cancelled = state.cancelled_at.is_some();

    let tasks: BTreeMap<_, _> = state
        .outcomes
        .into_iter()
        .map(|(index, outcome)| (graph.task(index).id.clone(), outcome))
        .collect();

    let outcome = BuildOutcome::new(
        build_id.clone(),
        cancelled,
        tasks,
        state.failures,
        engine.config.max_reported_failures,
        elapsed,
        Diagnostics {
            execution_times: state.execution_times,
        },
    );

    tracing::info!("Build finished {}", as_overhead(elapsed));
    Ok(outcome)
}
