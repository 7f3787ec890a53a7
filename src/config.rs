//! Settings of one build invocation.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheRetention;
use crate::core::TaskId;
use crate::error::EngineError;

/// What the caller wants to happen to a task in this build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedOutcome {
    #[default]
    Execute,
    /// Report the task as skipped without checking it. Its dependents still
    /// run.
    Skip,
}

/// Durations are written as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionConfig {
    /// Upper bound on tasks whose actions run at the same time.
    pub parallelism: usize,
    /// Stop starting new tasks after the first failure.
    pub fail_fast: bool,
    /// Applies to tasks without a timeout of their own.
    #[serde(with = "millis::option", rename = "taskTimeoutMs")]
    pub task_timeout: Option<Duration>,
    /// How long running tasks may go on after cancellation before they are
    /// interrupted.
    #[serde(with = "millis", rename = "cancelGraceMs")]
    pub cancel_grace: Duration,
    pub max_reported_failures: usize,
    pub requested: BTreeMap<TaskId, RequestedOutcome>,
    /// Applied to the local cache tier once the build is done.
    pub cache_retention: Option<CacheRetention>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            fail_fast: true,
            task_timeout: None,
            cancel_grace: Duration::from_secs(10),
            max_reported_failures: 10,
            requested: BTreeMap::new(),
            cache_retention: None,
        }
    }
}

impl ExecutionConfig {
    /// Parses settings from JSON. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Shorthand for `fail_fast(false)`.
    pub fn continue_on_failure(self) -> Self {
        self.fail_fast(false)
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn max_reported_failures(mut self, max: usize) -> Self {
        self.max_reported_failures = max;
        self
    }

    pub fn skip(mut self, task: impl Into<TaskId>) -> Self {
        self.requested.insert(task.into(), RequestedOutcome::Skip);
        self
    }

    pub fn cache_retention(mut self, retention: CacheRetention) -> Self {
        self.cache_retention = Some(retention);
        self
    }

    pub fn requested(&self, task: &TaskId) -> RequestedOutcome {
        self.requested.get(task).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExecutionConfig::default();
        assert!(config.parallelism >= 1);
        assert!(config.fail_fast);
        assert_eq!(config.cancel_grace, Duration::from_secs(10));
        assert_eq!(config.max_reported_failures, 10);
        assert_eq!(config.requested(&TaskId::new(":a")), RequestedOutcome::Execute);
    }

    #[test]
    fn test_from_json_keeps_defaults() {
        let config = ExecutionConfig::from_json(
            r#"{ "parallelism": 3, "taskTimeoutMs": 1500, "requested": { ":docs": "skip" } }"#,
        )
        .unwrap();

        assert_eq!(config.parallelism, 3);
        assert_eq!(config.task_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.requested(&TaskId::new(":docs")), RequestedOutcome::Skip);
        assert!(config.fail_fast);
        assert_eq!(config.cancel_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_json() {
        let err = ExecutionConfig::from_json(r#"{ "parallelism": "many" }"#).unwrap_err();
        assert!(matches!(err, EngineError::Settings(_)));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = ExecutionConfig::default()
            .parallelism(2)
            .continue_on_failure()
            .skip(":lint");
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ExecutionConfig::from_json(&json).unwrap(), config);
    }
}
