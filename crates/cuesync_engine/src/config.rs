//! Configuration for the sync engine.

use cuesync_protocol::{FieldPolicy, OwnerId};
use std::time::Duration;

/// Identity the engine syncs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncContext {
    /// Tenant whose records are synced.
    pub owner_id: OwnerId,
    /// Device running the engine, used in logs.
    pub device_id: String,
}

impl SyncContext {
    /// Creates a context.
    pub fn new(owner_id: OwnerId, device_id: impl Into<String>) -> Self {
        Self {
            owner_id,
            device_id: device_id.into(),
        }
    }
}

/// Configuration for sync cycles.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Who is syncing.
    pub context: SyncContext,
    /// Maximum entries per push call.
    pub push_batch_size: usize,
    /// Failed pushes after which an entry is discarded and surfaced.
    pub max_attempts: u32,
    /// Bound on each remote call.
    pub call_timeout: Duration,
    /// Fields that never auto-merge.
    pub field_policy: FieldPolicy,
    /// Host scheduling policy.
    pub schedule: SchedulePolicy,
}

impl SyncConfig {
    /// Creates a configuration with default tuning.
    pub fn new(context: SyncContext) -> Self {
        Self {
            context,
            push_batch_size: 50,
            max_attempts: 5,
            call_timeout: Duration::from_secs(30),
            field_policy: FieldPolicy::default(),
            schedule: SchedulePolicy::default(),
        }
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the attempt limit.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the remote call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the field policy.
    pub fn with_field_policy(mut self, policy: FieldPolicy) -> Self {
        self.field_policy = policy;
        self
    }

    /// Sets the scheduling policy.
    pub fn with_schedule(mut self, schedule: SchedulePolicy) -> Self {
        self.schedule = schedule;
        self
    }
}

/// How the host schedules cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulePolicy {
    /// Pause between successful cycles.
    pub min_interval: Duration,
    /// Skip cycles on metered networks.
    pub require_unmetered_network: bool,
    /// First backoff after a failed cycle.
    pub initial_backoff: Duration,
    /// Upper bound on any backoff.
    pub max_backoff: Duration,
    /// Growth factor between consecutive backoffs.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to backoffs.
    pub jitter: bool,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(15 * 60),
            require_unmetered_network: false,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60 * 60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl SchedulePolicy {
    /// Sets the interval between successful cycles.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Sets whether cycles need an unmetered network.
    pub fn with_require_unmetered_network(mut self, value: bool) -> Self {
        self.require_unmetered_network = value;
        self
    }

    /// Sets the first backoff.
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Sets the backoff cap.
    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets whether to jitter backoffs.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the `failures`-th consecutive unsuccessful cycle.
    ///
    /// Zero failures means no backoff. The result never exceeds
    /// `max_backoff`, jitter included.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let max = self.max_backoff.as_nanos() as f64;
        let base = self.initial_backoff.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let mut nanos = if base.is_finite() { base.min(max) } else { max };

        if self.jitter {
            nanos = (nanos + nanos * 0.25 * rand_jitter()).min(max);
        }
        Duration::from_nanos(nanos.max(0.0) as u64)
    }
}

/// Pseudo-random value in `[0, 1)` from the clock's sub-second nanos.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new(SyncContext::new(OwnerId::new("route-1"), "tablet-3"))
            .with_push_batch_size(0)
            .with_max_attempts(3)
            .with_call_timeout(Duration::from_secs(5));

        assert_eq!(config.push_batch_size, 1);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.context.device_id, "tablet-3");
        assert_eq!(
            config.field_policy.protected_fields(cuesync_protocol::EntityType::Expense),
            ["amount"]
        );
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = SchedulePolicy::default()
            .with_initial_backoff(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(policy.backoff_for(0), Duration::ZERO);
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = SchedulePolicy::default()
            .with_initial_backoff(Duration::from_secs(1))
            .with_max_backoff(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        for failures in 1..200 {
            assert!(policy.backoff_for(failures) <= Duration::from_secs(5));
        }
        assert_eq!(
            policy.clone().with_jitter(false).backoff_for(50),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = SchedulePolicy::default()
            .with_initial_backoff(Duration::from_millis(100))
            .with_max_backoff(Duration::from_secs(10));

        let delay = policy.backoff_for(1);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(125));
    }
}
