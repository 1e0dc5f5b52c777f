use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CoordError, Result};
use crate::model::ProductState;

/// Coordinator configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub store: StoreConfig,
    pub resolver: ResolverConfig,
    pub scheduler: SchedulerConfig,
    pub liveness: LivenessConfig,
    pub worker: WorkerConfig,
    /// Buffered wakeup notifications before old ones are dropped
    pub notify_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database path for persistence
    pub path: PathBuf,
    /// Keep everything in memory and discard on drop
    pub temporary: bool,
    /// Database cache size in bytes
    pub cache_capacity: u64,
    /// Background flush interval, `None` to flush only on demand
    pub flush_every_ms: Option<u64>,
}

/// How products without an edge of the queried role are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleMatch {
    /// No edge of the role means nothing to wait for: eligible
    Lenient,
    /// The product needs at least one edge of the role
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// States a product may be claimed from
    pub claimable_states: Vec<ProductState>,
    /// State an upstream must be in for an edge to count as satisfied.
    /// Defaults to `completed`, the state workers report on success.
    pub satisfied_state: ProductState,
    /// Per-role overrides of `satisfied_state`
    pub role_satisfied_states: HashMap<String, ProductState>,
    pub role_match: RoleMatch,
    /// Maximum candidates examined by one claim
    pub scan_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Claim attempts per call before reporting no work
    pub max_claim_attempts: usize,
}

/// What the reaper does with a stale running product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReapPolicy {
    /// Reset to `available` so another worker can pick it up
    Requeue,
    /// Mark as `error`
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    #[serde(with = "secs")]
    pub default_ttl: Duration,
    /// TTL per dependency role
    #[serde(with = "secs_map")]
    pub role_ttls: HashMap<String, Duration>,
    #[serde(with = "secs")]
    pub reap_interval: Duration,
    pub policy: ReapPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// First sleep after finding no work
    #[serde(with = "secs")]
    pub idle_backoff: Duration,
    #[serde(with = "secs")]
    pub max_idle_backoff: Duration,
    /// Upper bound on the heartbeat period; the worker also stays under half the TTL
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,
    /// Relative jitter applied to idle sleeps, in [0, 1)
    pub jitter: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("productflow.db"),
            temporary: false,
            cache_capacity: 64 * 1024 * 1024, // 64MB
            flush_every_ms: Some(500),
        }
    }
}

impl StoreConfig {
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            flush_every_ms: None,
            ..Default::default()
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            claimable_states: vec![ProductState::Waiting, ProductState::Available],
            satisfied_state: ProductState::Completed,
            role_satisfied_states: HashMap::new(),
            role_match: RoleMatch::Lenient,
            scan_limit: 10_000,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_claim_attempts: 8,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            role_ttls: HashMap::new(),
            reap_interval: Duration::from_secs(30),
            policy: ReapPolicy::Requeue,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_secs(1),
            max_idle_backoff: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            resolver: ResolverConfig::default(),
            scheduler: SchedulerConfig::default(),
            liveness: LivenessConfig::default(),
            worker: WorkerConfig::default(),
            notify_capacity: 64,
        }
    }
}

fn invalid<T>(message: impl Into<String>) -> Result<T> {
    Err(CoordError::InvalidConfiguration(message.into()))
}

impl CoordinatorConfig {
    /// Create a new builder for CoordinatorConfig
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Store validation
        if !self.store.temporary && self.store.path.as_os_str().is_empty() {
            return invalid("store.path must be set for a persistent store");
        }

        // Resolver validation
        if self.resolver.claimable_states.is_empty() {
            return invalid("resolver.claimable_states must not be empty");
        }
        if self.resolver.claimable_states.contains(&ProductState::Running) {
            return invalid("resolver.claimable_states cannot include running");
        }
        if self.resolver.scan_limit == 0 {
            return invalid("resolver.scan_limit must be greater than 0");
        }

        // Scheduler validation
        if self.scheduler.max_claim_attempts == 0 {
            return invalid("scheduler.max_claim_attempts must be greater than 0");
        }

        // Liveness validation
        if self.liveness.default_ttl.is_zero() {
            return invalid("liveness.default_ttl must be greater than 0");
        }
        if let Some((role, _)) = self.liveness.role_ttls.iter().find(|(_, ttl)| ttl.is_zero()) {
            return invalid(format!("liveness.role_ttls.{} must be greater than 0", role));
        }
        if self.liveness.reap_interval.is_zero() {
            return invalid("liveness.reap_interval must be greater than 0");
        }
        // a requeued product must not look finished to its dependents
        if self.liveness.policy == ReapPolicy::Requeue
            && self.resolver.satisfied_state == ProductState::Available
        {
            return invalid(
                "liveness.policy requeue resets products to available, which resolver.satisfied_state treats as satisfied",
            );
        }

        // Worker validation
        if self.worker.heartbeat_interval >= self.liveness.default_ttl {
            return invalid("worker.heartbeat_interval must be shorter than liveness.default_ttl");
        }
        if self.worker.idle_backoff > self.worker.max_idle_backoff {
            return invalid("worker.idle_backoff cannot exceed worker.max_idle_backoff");
        }
        if !(0.0..1.0).contains(&self.worker.jitter) {
            return invalid("worker.jitter must be in [0, 1)");
        }

        if self.notify_capacity == 0 {
            return invalid("notify_capacity must be greater than 0");
        }

        Ok(())
    }

    /// Create a configuration suited to development and tests
    pub fn development() -> Self {
        Self {
            store: StoreConfig::temporary(),
            liveness: LivenessConfig {
                default_ttl: Duration::from_secs(60),
                reap_interval: Duration::from_secs(5),
                ..Default::default()
            },
            worker: WorkerConfig {
                idle_backoff: Duration::from_millis(100),
                max_idle_backoff: Duration::from_secs(2),
                heartbeat_interval: Duration::from_secs(5),
                jitter: 0.1,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for large deployments
    pub fn production() -> Self {
        Self {
            store: StoreConfig {
                cache_capacity: 256 * 1024 * 1024, // 256MB
                ..Default::default()
            },
            resolver: ResolverConfig {
                scan_limit: 100_000,
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                max_claim_attempts: 16,
            },
            notify_capacity: 1024,
            ..Default::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Builder for CoordinatorConfig
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl Default for CoordinatorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinatorConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
        }
    }

    /// Set database path
    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store.path = path.into();
        self.config.store.temporary = false;
        self
    }

    /// Use an in-memory store
    pub fn temporary_store(mut self) -> Self {
        self.config.store = StoreConfig::temporary();
        self
    }

    pub fn claimable_states(mut self, states: Vec<ProductState>) -> Self {
        self.config.resolver.claimable_states = states;
        self
    }

    pub fn satisfied_state(mut self, state: ProductState) -> Self {
        self.config.resolver.satisfied_state = state;
        self
    }

    pub fn role_satisfied_state(mut self, role: impl Into<String>, state: ProductState) -> Self {
        self.config
            .resolver
            .role_satisfied_states
            .insert(role.into(), state);
        self
    }

    /// Maximum eligible candidates examined per claim
    pub fn scan_limit(mut self, limit: usize) -> Self {
        self.config.resolver.scan_limit = limit;
        self
    }

    pub fn role_match(mut self, role_match: RoleMatch) -> Self {
        self.config.resolver.role_match = role_match;
        self
    }

    pub fn max_claim_attempts(mut self, attempts: usize) -> Self {
        self.config.scheduler.max_claim_attempts = attempts;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.liveness.default_ttl = ttl;
        self
    }

    pub fn role_ttl(mut self, role: impl Into<String>, ttl: Duration) -> Self {
        self.config.liveness.role_ttls.insert(role.into(), ttl);
        self
    }

    pub fn reap_policy(mut self, policy: ReapPolicy) -> Self {
        self.config.liveness.policy = policy;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.config.liveness.reap_interval = interval;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.worker.heartbeat_interval = interval;
        self
    }

    /// Set idle backoff bounds
    pub fn idle_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.worker.idle_backoff = initial;
        self.config.worker.max_idle_backoff = max;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.config.worker.jitter = jitter;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<CoordinatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Durations as (fractional) seconds
mod secs {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

mod secs_map {
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        map: &HashMap<String, Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(k, v)| (k.clone(), v.as_secs_f64()))
            .collect::<HashMap<String, f64>>()
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<HashMap<String, Duration>, D::Error> {
        HashMap::<String, f64>::deserialize(d)?
            .into_iter()
            .map(|(k, v)| {
                Duration::try_from_secs_f64(v)
                    .map(|d| (k, d))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}
