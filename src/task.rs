//! The task model consumed by the engine.
//!
//! A [`TaskNode`] is a plain description of one unit of work: what it reads,
//! what it writes, how it is ordered relative to other tasks and the actions
//! that perform it. Nothing is discovered by reflection; the configuration
//! front end builds the descriptor list up front and hands it over.

use std::borrow::Cow;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::core::{Blake3Hasher, BuildId, Hash32, TaskId};
use crate::error::{FingerprintError, Interrupted, RuntimeError};
use crate::fingerprint::{DirectorySensitivity, NormalizationPolicy};

/// Semantic type of an input property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    File,
    Directory,
    FileCollection,
    Scalar,
}

/// The value bound to an input property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputValue {
    /// A single regular file.
    File(Utf8PathBuf),
    /// A directory, visited recursively.
    Directory(Utf8PathBuf),
    /// An explicit list of files. Relative entries are resolved against `base`,
    /// which is also the root for [`NormalizationPolicy::RelativePath`].
    Files {
        base: Utf8PathBuf,
        paths: Vec<Utf8PathBuf>,
    },
    /// Every path matching `pattern` below `base`.
    Glob { base: Utf8PathBuf, pattern: String },
    /// An opaque value, already encoded as bytes.
    Scalar(Vec<u8>),
}

impl InputValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            InputValue::File(_) => PropertyKind::File,
            InputValue::Directory(_) => PropertyKind::Directory,
            InputValue::Files { .. } | InputValue::Glob { .. } => PropertyKind::FileCollection,
            InputValue::Scalar(_) => PropertyKind::Scalar,
        }
    }
}

/// A declared input of a task.
#[derive(Debug, Clone)]
pub struct InputProperty {
    pub(crate) name: String,
    pub(crate) value: Option<InputValue>,
    pub(crate) normalization: NormalizationPolicy,
    pub(crate) sensitivity: DirectorySensitivity,
    pub(crate) optional: bool,
}

impl InputProperty {
    fn with_value(name: impl Into<String>, value: Option<InputValue>) -> Self {
        Self {
            name: name.into(),
            value,
            normalization: NormalizationPolicy::AbsolutePath,
            sensitivity: DirectorySensitivity::Default,
            optional: false,
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        Self::with_value(name, Some(InputValue::File(path.into())))
    }

    pub fn directory(name: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        Self::with_value(name, Some(InputValue::Directory(path.into())))
    }

    pub fn files<I, P>(name: impl Into<String>, base: impl Into<Utf8PathBuf>, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        let value = InputValue::Files {
            base: base.into(),
            paths: paths.into_iter().map(Into::into).collect(),
        };
        Self::with_value(name, Some(value))
    }

    /// A file collection matching `pattern` (e.g. `src/**/*.java`) below `base`.
    pub fn glob(
        name: impl Into<String>,
        base: impl Into<Utf8PathBuf>,
        pattern: impl Into<String>,
    ) -> Self {
        let value = InputValue::Glob {
            base: base.into(),
            pattern: pattern.into(),
        };
        Self::with_value(name, Some(value))
    }

    /// A scalar property. The value is encoded as CBOR, so any two values with
    /// the same serialized form fingerprint identically.
    pub fn scalar<T>(name: impl Into<String>, value: &T) -> Result<Self, RuntimeError>
    where
        T: Serialize + ?Sized,
    {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes)
            .map_err(|e| anyhow::anyhow!("couldn't encode scalar input: {e}"))?;
        Ok(Self::with_value(name, Some(InputValue::Scalar(bytes))))
    }

    pub fn scalar_bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::with_value(name, Some(InputValue::Scalar(bytes.into())))
    }

    /// A property whose value the front end could not provide.
    ///
    /// Unless marked [`optional`](Self::optional), freezing a graph that
    /// contains it fails.
    pub fn unset(name: impl Into<String>) -> Self {
        Self::with_value(name, None)
    }

    pub fn normalization(mut self, policy: NormalizationPolicy) -> Self {
        self.normalization = policy;
        self
    }

    pub fn directory_sensitivity(mut self, sensitivity: DirectorySensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn ignore_empty_directories(self) -> Self {
        self.directory_sensitivity(DirectorySensitivity::IgnoreEmpty)
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<&InputValue> {
        self.value.as_ref()
    }

    pub fn kind(&self) -> Option<PropertyKind> {
        self.value.as_ref().map(InputValue::kind)
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum OutputKind {
    File,
    Directory,
}

/// A declared output of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputProperty {
    pub(crate) name: String,
    pub(crate) kind: OutputKind,
    pub(crate) location: Utf8PathBuf,
}

impl OutputProperty {
    pub fn file(name: impl Into<String>, location: impl Into<Utf8PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: OutputKind::File,
            location: location.into(),
        }
    }

    pub fn directory(name: impl Into<String>, location: impl Into<Utf8PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: OutputKind::Directory,
            location: location.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub fn location(&self) -> &Utf8Path {
        &self.location
    }
}

/// What an action asks the engine to do next.
#[derive(Debug)]
pub enum ActionResult {
    /// The action completed, go on with the next one.
    Continue,
    /// Stop this action early and go on with the next one.
    StopAction,
    /// Skip the remaining actions; the task still counts as succeeded.
    StopTask,
    /// The task failed.
    Fail(RuntimeError),
}

impl ActionResult {
    pub fn fail(error: impl Into<RuntimeError>) -> Self {
        ActionResult::Fail(error.into())
    }
}

impl<E> From<Result<(), E>> for ActionResult
where
    E: Into<RuntimeError>,
{
    fn from(value: Result<(), E>) -> Self {
        match value {
            Ok(()) => ActionResult::Continue,
            Err(e) => ActionResult::Fail(e.into()),
        }
    }
}

/// The executable part of a task.
///
/// Variant behaviour (copying, compiling, ...) is injected as an `Action`
/// rather than through a type hierarchy. Any
/// `Fn(&TaskContext) -> ActionResult` closure is an action.
pub trait Action: Send + Sync {
    fn run(&self, context: &TaskContext<'_>) -> ActionResult;

    /// Identity of the code behind this action. It contributes to the task's
    /// implementation hash, so changing it invalidates previous results.
    fn implementation(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }
}

impl<F> Action for F
where
    F: Fn(&TaskContext<'_>) -> ActionResult + Send + Sync,
{
    fn run(&self, context: &TaskContext<'_>) -> ActionResult {
        self(context)
    }
}

/// Shared flag used to cancel a whole build from the outside (e.g. on
/// Ctrl-C). Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Why a running task was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterruptCause {
    TimedOut,
    Cancelled,
}

/// Per-task interruption flag, raised by the coordinator on timeout or after
/// the cancellation grace period. The first cause wins.
#[derive(Debug, Clone, Default)]
pub(crate) struct Interrupt(Arc<AtomicU8>);

impl Interrupt {
    const CLEAR: u8 = 0;
    const TIMED_OUT: u8 = 1;
    const CANCELLED: u8 = 2;

    pub(crate) fn raise(&self, cause: InterruptCause) {
        let value = match cause {
            InterruptCause::TimedOut => Self::TIMED_OUT,
            InterruptCause::Cancelled => Self::CANCELLED,
        };
        let _ = self
            .0
            .compare_exchange(Self::CLEAR, value, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub(crate) fn cause(&self) -> Option<InterruptCause> {
        match self.0.load(Ordering::SeqCst) {
            Self::TIMED_OUT => Some(InterruptCause::TimedOut),
            Self::CANCELLED => Some(InterruptCause::Cancelled),
            _ => None,
        }
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.cause().is_some()
    }
}

/// The context passed to every action.
///
/// It gives read access to the task's own declaration and lets long running
/// actions cooperate with timeouts and cancellation through
/// [`checkpoint`](Self::checkpoint).
pub struct TaskContext<'a> {
    pub(crate) task: &'a TaskNode,
    pub(crate) build: &'a BuildId,
    pub(crate) interrupt: &'a Interrupt,
    /// Tracing span assigned to this task.
    pub(crate) span: tracing::Span,
}

impl<'a> TaskContext<'a> {
    pub fn id(&self) -> &TaskId {
        &self.task.id
    }

    pub fn task(&self) -> &TaskNode {
        self.task
    }

    pub fn build_id(&self) -> &BuildId {
        self.build
    }

    /// Location of the named output property.
    pub fn output(&self, name: &str) -> Option<&'a Utf8Path> {
        self.task
            .outputs
            .iter()
            .find(|output| output.name == name)
            .map(|output| output.location.as_path())
    }

    pub fn input(&self, name: &str) -> Option<&'a InputValue> {
        self.task
            .inputs
            .iter()
            .find(|input| input.name == name)
            .and_then(|input| input.value.as_ref())
    }

    /// Regular files currently matched by the named input property, sorted.
    pub fn input_files(&self, name: &str) -> Result<Vec<Utf8PathBuf>, FingerprintError> {
        match self.input(name) {
            Some(value) => crate::fingerprint::resolve_files(value),
            None => Ok(Vec::new()),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_raised()
    }

    /// Returns an error once the task has been asked to stop. Long running
    /// actions should call this periodically.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        if self.is_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

/// A single task in the work graph.
#[derive(Clone)]
pub struct TaskNode {
    pub(crate) id: TaskId,
    pub(crate) implementation: String,
    pub(crate) description: Option<String>,
    pub(crate) actions: Vec<Arc<dyn Action>>,
    pub(crate) inputs: Vec<InputProperty>,
    pub(crate) outputs: Vec<OutputProperty>,
    pub(crate) depends_on: Vec<TaskId>,
    pub(crate) must_run_after: Vec<TaskId>,
    pub(crate) finalized_by: Vec<TaskId>,
    pub(crate) cacheable: bool,
    pub(crate) reason_not_to_cache: Option<String>,
    pub(crate) reason_not_to_track_state: Option<String>,
    pub(crate) timeout: Option<Duration>,
}

impl TaskNode {
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            implementation: String::from("task"),
            description: None,
            actions: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            depends_on: Vec::new(),
            must_run_after: Vec::new(),
            finalized_by: Vec::new(),
            cacheable: false,
            reason_not_to_cache: None,
            reason_not_to_track_state: None,
            timeout: None,
        }
    }

    /// Identity and version of the task type, e.g. `javac@17`.
    pub fn implementation(mut self, implementation: impl Into<String>) -> Self {
        self.implementation = implementation.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn action(mut self, action: impl Action + 'static) -> Self {
        self.actions.push(Arc::new(action));
        self
    }

    /// Appends a closure action.
    pub fn run<F>(self, action: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> ActionResult + Send + Sync + 'static,
    {
        self.action(action)
    }

    pub fn input(mut self, property: InputProperty) -> Self {
        self.inputs.push(property);
        self
    }

    pub fn output(mut self, property: OutputProperty) -> Self {
        self.outputs.push(property);
        self
    }

    pub fn output_file(self, name: impl Into<String>, location: impl Into<Utf8PathBuf>) -> Self {
        self.output(OutputProperty::file(name, location))
    }

    pub fn output_dir(self, name: impl Into<String>, location: impl Into<Utf8PathBuf>) -> Self {
        self.output(OutputProperty::directory(name, location))
    }

    pub fn depends_on(mut self, task: impl Into<TaskId>) -> Self {
        self.depends_on.push(task.into());
        self
    }

    pub fn must_run_after(mut self, task: impl Into<TaskId>) -> Self {
        self.must_run_after.push(task.into());
        self
    }

    pub fn finalized_by(mut self, task: impl Into<TaskId>) -> Self {
        self.finalized_by.push(task.into());
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn not_cacheable(mut self, reason: impl Into<String>) -> Self {
        self.reason_not_to_cache = Some(reason.into());
        self
    }

    /// Opts the task out of up-to-date checking, history and caching.
    pub fn untracked(mut self, reason: impl Into<String>) -> Self {
        self.reason_not_to_track_state = Some(reason.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn inputs(&self) -> &[InputProperty] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputProperty] {
        &self.outputs
    }

    pub fn get_description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn reason_not_to_track_state(&self) -> Option<&str> {
        self.reason_not_to_track_state.as_deref()
    }

    /// Why this task's outputs may not be stored in or loaded from the cache.
    pub fn reason_not_to_cache(&self) -> Option<Cow<'_, str>> {
        if let Some(reason) = &self.reason_not_to_track_state {
            return Some(Cow::Owned(format!("state is not tracked: {reason}")));
        }
        if let Some(reason) = &self.reason_not_to_cache {
            return Some(Cow::Borrowed(reason));
        }
        if !self.cacheable {
            return Some(Cow::Borrowed("caching has not been enabled for the task"));
        }
        if self.outputs.is_empty() {
            return Some(Cow::Borrowed("no outputs declared"));
        }
        None
    }

    pub fn is_cacheable(&self) -> bool {
        self.reason_not_to_cache().is_none()
    }

    /// Hash of the implementation identity and of every action's identity.
    pub fn implementation_hash(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::with_domain("implementation");
        hasher.update_str(&self.implementation);
        for action in &self.actions {
            hasher.update_str(&action.implementation());
        }
        hasher.into()
    }
}

impl Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("implementation", &self.implementation)
            .field("actions", &self.actions.len())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("depends_on", &self.depends_on)
            .field("must_run_after", &self.must_run_after)
            .field("finalized_by", &self.finalized_by)
            .field("cacheable", &self.cacheable)
            .finish()
    }
}
