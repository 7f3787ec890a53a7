use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

pub use anyhow::Error as RuntimeError;

use crate::core::TaskId;

/// Renders a cycle as `a -> b -> c -> a`.
fn format_cycle(path: &[TaskId]) -> String {
    path.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Problems with the shape of the work graph. These are detected before any
/// task runs and abort the whole build.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Task '{0}' was added to the graph more than once")]
    DuplicateTask(TaskId),

    #[error("Task '{task}' references unknown task '{referenced}'")]
    UnknownTask { task: TaskId, referenced: TaskId },

    #[error("Circular dependency between the following tasks: {}", format_cycle(.0))]
    Cycle(Vec<TaskId>),

    #[error("No value has been specified for required input property '{property}' of task '{task}'")]
    MissingInput { task: TaskId, property: String },

    #[error("Task '{task}' declares property '{property}' more than once")]
    DuplicateProperty { task: TaskId, property: String },
}

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("Couldn't read '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("File '{path}' of required input property '{property}' does not exist")]
    MissingFile { property: String, path: Utf8PathBuf },

    #[error("Input property '{property}':\n{source}")]
    Property {
        property: String,
        #[source]
        source: Box<FingerprintError>,
    },

    #[error("Output property '{property}':\n{source}")]
    OutputProperty {
        property: String,
        #[source]
        source: Box<FingerprintError>,
    },
}

impl FingerprintError {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn in_property(self, property: &str) -> Self {
        match self {
            err @ (Self::MissingFile { .. } | Self::Property { .. }) => err,
            err => Self::Property {
                property: property.to_string(),
                source: Box::new(err),
            },
        }
    }

    pub(crate) fn in_output(self, property: &str) -> Self {
        match self {
            err @ Self::OutputProperty { .. } => err,
            err => Self::OutputProperty {
                property: property.to_string(),
                source: Box::new(err),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode history record.\n{0}")]
    Encode(String),

    #[error("Couldn't lock '{path}'.\n{source}")]
    Lock {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode cache entry.\n{0}")]
    Encode(String),

    #[error("Couldn't decode cache entry.\n{0}")]
    Decode(String),

    #[error("Couldn't lock '{path}'.\n{source}")]
    Lock {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache tier '{tier}' did not answer within {after:?}")]
    Timeout { tier: String, after: Duration },

    #[error("Cache tier '{0}' is unavailable")]
    Unavailable(String),

    #[error("Cache entry has no data for output property '{0}'")]
    MissingProperty(String),

    #[error("Cache entry path '{0}' escapes its output location")]
    InvalidPath(String),
}

/// Why a single task failed. Never crosses the coordinator as a panic; it is
/// recorded in the task's outcome instead.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Couldn't fingerprint the task.\n{0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("{0:#}")]
    Action(anyhow::Error),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Task timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Task was interrupted")]
    Interrupted,
}

/// Raised by [`TaskContext::checkpoint`](crate::TaskContext::checkpoint) once
/// the running task has been asked to stop.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Task was interrupted")]
pub struct Interrupted;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid work graph.\n{0}")]
    Config(#[from] ConfigError),

    #[error("Couldn't start worker pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Couldn't open execution history.\n{0}")]
    History(#[from] HistoryError),

    #[error("Couldn't open build cache.\n{0}")]
    Cache(#[from] CacheError),

    #[error("Invalid configuration.\n{0}")]
    Settings(#[from] serde_json::Error),

    #[error("Couldn't set up progress style.\n{0}")]
    Template(#[from] indicatif::style::TemplateError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_full_path() {
        let err = ConfigError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(
            err.to_string(),
            "Circular dependency between the following tasks: a -> b -> a"
        );
    }

    #[test]
    fn test_property_context_is_not_nested_twice() {
        let inner = FingerprintError::io("x", std::io::Error::other("boom"));
        let err = inner.in_property("src").in_property("other");
        match err {
            FingerprintError::Property { property, .. } => assert_eq!(property, "src"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_output_context_names_output() {
        let inner = FingerprintError::io("build/out", std::io::Error::other("boom"));
        let err = inner.in_output("classes").in_output("other");
        assert!(
            err.to_string().starts_with("Output property 'classes':"),
            "{err}"
        );
    }
}
