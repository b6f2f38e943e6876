//! Manager configuration.

use std::time::Duration;

/// Default quiesce timeout applied to a newly created set.
pub const DEFAULT_SET_TIMEOUT: Duration = Duration::from_secs(60);

/// Default expiration applied to a newly created set.
pub const DEFAULT_SET_EXPIRATION: Duration = Duration::from_secs(60);

/// Replica time-zero drift above which a resync is reported.
pub const DEFAULT_TIME_ZERO_DRIFT_WARN: Duration = Duration::from_secs(1);

/// Tunables of a quiesce database manager.
///
/// None of these affect replication semantics. Set defaults are only used when a
/// creating request does not carry its own `timeout`/`expiration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuiesceDbConfig {
    /// Quiesce timeout given to new sets.
    pub default_timeout: Duration,
    /// Expiration given to new sets.
    pub default_expiration: Duration,
    /// Replicas log a time-zero rebase larger than this.
    pub time_zero_drift_warn: Duration,
}

impl Default for QuiesceDbConfig {
    fn default() -> Self {
        QuiesceDbConfig {
            default_timeout: DEFAULT_SET_TIMEOUT,
            default_expiration: DEFAULT_SET_EXPIRATION,
            time_zero_drift_warn: DEFAULT_TIME_ZERO_DRIFT_WARN,
        }
    }
}

impl QuiesceDbConfig {
    /// Override the default set timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Override the default set expiration.
    pub fn with_default_expiration(mut self, expiration: Duration) -> Self {
        self.default_expiration = expiration;
        self
    }
}
