//! Build cache.
//!
//! A task whose outputs were produced before, by the same implementation from
//! the same inputs, can have those outputs restored instead of running again.
//! Entries are addressed by a [`CacheKey`] and hold an [`OutputBundle`].
//!
//! The cache is strictly advisory. Every error on the way in or out is logged
//! and treated as a miss, so a broken or slow cache can only make a build
//! slower, never wrong.

pub mod bundle;
pub mod local;

use std::fmt::{self, Display};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};
use crate::error::CacheError;
use crate::fingerprint::InputFingerprints;
use crate::task::TaskNode;

pub use bundle::OutputBundle;
pub use local::{CacheRetention, EvictionStats, LocalCache};

/// Address of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(Hash32);

impl CacheKey {
    pub fn new<I, S>(implementation: Hash32, inputs: Hash32, output_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<S> = output_names.into_iter().collect();
        names.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));

        let mut hasher = Blake3Hasher::with_domain("cache-key");
        hasher.update_hash(&implementation).update_hash(&inputs);
        for name in &names {
            hasher.update_str(name.as_ref());
        }

        Self(hasher.into())
    }

    pub fn for_task(task: &TaskNode, inputs: &InputFingerprints) -> Self {
        Self::new(
            task.implementation_hash(),
            inputs.hash,
            task.outputs.iter().map(|output| output.name.as_str()),
        )
    }

    pub fn hash(&self) -> Hash32 {
        self.0
    }

    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// One place cache entries can live, such as a local directory or a remote
/// server.
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self, key: &CacheKey) -> Result<Option<OutputBundle>, CacheError>;

    fn store(&self, key: &CacheKey, bundle: &OutputBundle) -> Result<(), CacheError>;
}

/// Whether entries are read from (`pull`) and written to (`push`) a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub pull: bool,
    pub push: bool,
}

impl TierPolicy {
    pub const PULL_PUSH: Self = Self {
        pull: true,
        push: true,
    };

    pub const PULL_ONLY: Self = Self {
        pull: true,
        push: false,
    };
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::PULL_PUSH
    }
}

struct Tier {
    tier: Arc<dyn CacheTier>,
    policy: TierPolicy,
}

struct RemoteTier {
    tier: Tier,
    timeout: Duration,
}

/// Runs `call` on a helper thread and gives up after `timeout`. The helper is
/// left to finish on its own.
///
/// Nothing bounds the helpers still running: a tier that never answers keeps
/// one thread alive per abandoned request until the process exits.
fn with_timeout<T, F>(tier: &str, timeout: Duration, call: F) -> Result<T, CacheError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();

    thread::Builder::new()
        .name(format!("tsumiki-cache-{tier}"))
        .spawn(move || {
            let _ = sender.send(call());
        })?;

    match receiver.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(CacheError::Timeout {
            tier: tier.to_string(),
            after: timeout,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(CacheError::Unavailable(tier.to_string())),
    }
}

/// The local and remote tiers together.
#[derive(Default)]
pub struct ResultCache {
    local: Option<Tier>,
    remote: Option<RemoteTier>,
}

impl ResultCache {
    /// A cache with no tiers; every load misses.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_local(mut self, tier: Arc<dyn CacheTier>, policy: TierPolicy) -> Self {
        self.local = Some(Tier { tier, policy });
        self
    }

    pub fn with_remote(
        mut self,
        tier: Arc<dyn CacheTier>,
        policy: TierPolicy,
        timeout: Duration,
    ) -> Self {
        self.remote = Some(RemoteTier {
            tier: Tier { tier, policy },
            timeout,
        });
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.local.is_some() || self.remote.is_some()
    }

    /// Looks `key` up, local tier first. A remote hit is copied into the local
    /// tier before it is returned.
    pub fn load(&self, key: &CacheKey) -> Option<OutputBundle> {
        if let Some(local) = self.local.as_ref().filter(|t| t.policy.pull) {
            match local.tier.load(key) {
                Ok(Some(bundle)) => {
                    tracing::debug!(%key, tier = local.tier.name(), "cache hit");
                    return Some(bundle);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(%key, tier = local.tier.name(), "cache load failed: {e}"),
            }
        }

        let remote = self.remote.as_ref().filter(|r| r.tier.policy.pull)?;
        let name = remote.tier.tier.name().to_string();
        let tier = Arc::clone(&remote.tier.tier);
        let lookup = *key;

        match with_timeout(&name, remote.timeout, move || tier.load(&lookup)) {
            Ok(Some(bundle)) => {
                tracing::debug!(%key, tier = %name, "cache hit");
                if let Some(local) = self.local.as_ref().filter(|t| t.policy.push)
                    && let Err(e) = local.tier.store(key, &bundle)
                {
                    tracing::warn!(%key, tier = local.tier.name(), "couldn't mirror cache entry: {e}");
                }
                Some(bundle)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(%key, tier = %name, "cache load failed: {e}");
                None
            }
        }
    }

    /// Stores `bundle` in every tier that accepts pushes. Failures are logged.
    pub fn store(&self, key: &CacheKey, bundle: &OutputBundle) {
        if let Some(local) = self.local.as_ref().filter(|t| t.policy.push)
            && let Err(e) = local.tier.store(key, bundle)
        {
            tracing::warn!(%key, tier = local.tier.name(), "cache store failed: {e}");
        }

        if let Some(remote) = self.remote.as_ref().filter(|r| r.tier.policy.push) {
            let name = remote.tier.tier.name().to_string();
            let tier = Arc::clone(&remote.tier.tier);
            let (lookup, bundle) = (*key, bundle.clone());

            if let Err(e) = with_timeout(&name, remote.timeout, move || tier.store(&lookup, &bundle)) {
                tracing::warn!(%key, tier = %name, "cache store failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::cache::bundle::BundleMetadata;
    use crate::core::{BuildId, TaskId};

    #[derive(Default)]
    struct MemoryTier {
        entries: Mutex<HashMap<CacheKey, OutputBundle>>,
        delay: Option<Duration>,
        broken: bool,
    }

    impl CacheTier for MemoryTier {
        fn name(&self) -> &str {
            "memory"
        }

        fn load(&self, key: &CacheKey) -> Result<Option<OutputBundle>, CacheError> {
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            if self.broken {
                return Err(CacheError::Unavailable("memory".into()));
            }
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        fn store(&self, key: &CacheKey, bundle: &OutputBundle) -> Result<(), CacheError> {
            if self.broken {
                return Err(CacheError::Unavailable("memory".into()));
            }
            self.entries.lock().unwrap().insert(*key, bundle.clone());
            Ok(())
        }
    }

    fn bundle() -> OutputBundle {
        OutputBundle {
            metadata: BundleMetadata {
                task: TaskId::new(":a"),
                build_id: BuildId::new("b"),
                created_at: 0,
                execution_time: Duration::ZERO,
            },
            outputs: Vec::new(),
        }
    }

    fn key() -> CacheKey {
        CacheKey::new(Hash32::hash("impl"), Hash32::hash("in"), ["b", "a"])
    }

    #[test]
    fn test_key_ignores_output_order() {
        let a = CacheKey::new(Hash32::hash("impl"), Hash32::hash("in"), ["a", "b"]);
        let c = CacheKey::new(Hash32::hash("impl2"), Hash32::hash("in"), ["a", "b"]);
        assert_eq!(a, key());
        assert_ne!(a, c);
    }

    #[test]
    fn test_remote_hit_is_mirrored() {
        let local = Arc::new(MemoryTier::default());
        let remote = Arc::new(MemoryTier::default());
        remote.store(&key(), &bundle()).unwrap();

        let cache = ResultCache::disabled()
            .with_local(local.clone(), TierPolicy::PULL_PUSH)
            .with_remote(remote, TierPolicy::PULL_ONLY, Duration::from_secs(5));

        assert_eq!(cache.load(&key()), Some(bundle()));
        assert_eq!(local.load(&key()).unwrap(), Some(bundle()));
    }

    #[test]
    fn test_slow_remote_is_miss() {
        let remote = Arc::new(MemoryTier {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        remote.store(&key(), &bundle()).unwrap();

        let cache = ResultCache::disabled().with_remote(
            remote,
            TierPolicy::PULL_ONLY,
            Duration::from_millis(20),
        );

        assert_eq!(cache.load(&key()), None);
    }

    #[test]
    fn test_errors_are_soft() {
        let broken = Arc::new(MemoryTier {
            broken: true,
            ..Default::default()
        });
        let cache = ResultCache::disabled().with_local(broken, TierPolicy::PULL_PUSH);

        cache.store(&key(), &bundle());
        assert_eq!(cache.load(&key()), None);
        assert!(ResultCache::disabled().load(&key()).is_none());
    }
}
