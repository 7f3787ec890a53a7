#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod cache;
mod config;
mod core;
mod engine;
mod error;
mod events;
pub mod fingerprint;
mod graph;
mod history;
mod lock;
#[cfg(feature = "logging")]
pub mod logging;
mod outcome;
mod task;
mod utils;

pub use crate::cache::{CacheKey, CacheTier, LocalCache, ResultCache, TierPolicy};
pub use crate::config::{ExecutionConfig, RequestedOutcome};
pub use crate::core::{BuildId, Hash32, TaskId};
pub use crate::engine::checker::{self, CheckState, MAX_REASONS};
pub use crate::engine::{Diagnostics, Engine, EngineBuilder, TaskExecution};
pub use crate::error::*;
pub use crate::events::{EventKind, EventListener, EventLog, JsonLinesListener, TaskEvent, TracingListener};
pub use crate::fingerprint::{DirectorySensitivity, Fingerprint, InputFingerprints, NormalizationPolicy};
pub use crate::graph::{EdgeKind, FrozenGraph, WorkGraph};
pub use crate::history::{ExecutionHistoryRecord, ExecutionHistoryStore, OriginMetadata, RecordedOutcome};
pub use crate::outcome::{BuildOutcome, BuildResult, OutcomeCounts, SkipReason, TaskFailure, TaskOutcome};
pub use crate::task::{
    Action, ActionResult, CancellationToken, InputProperty, InputValue, OutputKind, OutputProperty,
    PropertyKind, TaskContext, TaskNode,
};
