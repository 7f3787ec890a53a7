pub mod checker;
pub(crate) mod pipeline;
mod runner;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::cache::{CacheTier, LocalCache, ResultCache, TierPolicy};
use crate::config::ExecutionConfig;
use crate::error::EngineError;
use crate::events::{EventListener, TracingListener};
use crate::graph::{FrozenGraph, WorkGraph};
use crate::history::ExecutionHistoryStore;
use crate::outcome::BuildOutcome;
use crate::task::CancellationToken;

pub use runner::{Diagnostics, TaskExecution};

/// Runs work graphs.
///
/// One engine can execute any number of graphs, one after another; each call
/// to [`Engine::execute`] is a separate build invocation with its own build
/// id.
pub struct Engine {
    pub(crate) config: ExecutionConfig,
    pub(crate) history: Option<ExecutionHistoryStore>,
    pub(crate) cache: ResultCache,
    /// Kept around for eviction.
    pub(crate) local_cache: Option<LocalCache>,
    pub(crate) listeners: Vec<Arc<dyn EventListener>>,
    pub(crate) cancel: CancellationToken,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// An engine without history or cache. Every task runs on every build.
    pub fn new(config: ExecutionConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Handle to cancel the build run by this engine.
    ///
    /// A cancellation applies to the build in progress, or to the next one if
    /// none is running. It is cleared when that build returns.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs every task of `graph`.
    ///
    /// Failures of individual tasks are reported in the returned
    /// [`BuildOutcome`]; `Err` means the build could not be run at all.
    pub fn execute(&self, graph: &FrozenGraph) -> Result<BuildOutcome, EngineError> {
        tracing::debug!(tasks = graph.len(), "executing work graph");
        let outcome = runner::run_tasks_parallel(self, graph);
        self.cancel.reset();
        let outcome = outcome?;

        if let (Some(local), Some(retention)) = (&self.local_cache, &self.config.cache_retention) {
            match local.evict(retention) {
                Ok(stats) => tracing::debug!(
                    removed = stats.removed,
                    freed = stats.freed,
                    kept = stats.kept,
                    "evicted cache entries"
                ),
                Err(e) => tracing::warn!("couldn't clean up the local cache: {e}"),
            }
        }

        Ok(outcome)
    }

    /// Freezes `graph` and runs it. A malformed graph fails before any task
    /// starts.
    pub fn run(&self, graph: WorkGraph) -> Result<BuildOutcome, EngineError> {
        let graph = graph.freeze()?;
        self.execute(&graph)
    }
}

#[derive(Default)]
pub struct EngineBuilder {
    config: ExecutionConfig,
    history: Option<ExecutionHistoryStore>,
    cache: ResultCache,
    local_cache: Option<LocalCache>,
    listeners: Vec<Arc<dyn EventListener>>,
    cancel: CancellationToken,
}

impl EngineBuilder {
    pub fn config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn history(mut self, history: ExecutionHistoryStore) -> Self {
        self.history = Some(history);
        self
    }

    /// Opens the history store at `path`.
    pub fn history_dir(self, path: impl Into<Utf8PathBuf>) -> Result<Self, EngineError> {
        let history = ExecutionHistoryStore::open(path)?;
        Ok(self.history(history))
    }

    pub fn local_cache(mut self, cache: LocalCache, policy: TierPolicy) -> Self {
        self.cache = self.cache.with_local(Arc::new(cache.clone()), policy);
        self.local_cache = Some(cache);
        self
    }

    /// Opens a local cache tier at `path` that is both read and written.
    pub fn local_cache_dir(self, path: impl Into<Utf8PathBuf>) -> Result<Self, EngineError> {
        let cache = LocalCache::open(path)?;
        Ok(self.local_cache(cache, TierPolicy::PULL_PUSH))
    }

    /// Calls to a remote tier that take longer than `timeout` count as a
    /// miss. The abandoned call keeps its thread until it returns.
    pub fn remote_cache(
        mut self,
        tier: Arc<dyn CacheTier>,
        policy: TierPolicy,
        timeout: Duration,
    ) -> Self {
        self.cache = self.cache.with_remote(tier, policy, timeout);
        self
    }

    /// Adds a listener. Without any, events are logged through `tracing`.
    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn build(self) -> Engine {
        let mut listeners = self.listeners;
        if listeners.is_empty() {
            listeners.push(Arc::new(TracingListener));
        }

        Engine {
            config: self.config,
            history: self.history,
            cache: self.cache,
            local_cache: self.local_cache,
            listeners,
            cancel: self.cancel,
        }
    }
}
