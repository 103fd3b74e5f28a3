//! Backoff command implementation.

use cuesync_engine::SchedulePolicy;
use std::time::Duration;

/// Builds the policy described by the command arguments.
pub fn policy(initial_secs: u64, max_secs: u64, multiplier: f64, jitter: bool) -> SchedulePolicy {
    SchedulePolicy::default()
        .with_initial_backoff(Duration::from_secs(initial_secs))
        .with_max_backoff(Duration::from_secs(max_secs))
        .with_backoff_multiplier(multiplier)
        .with_jitter(jitter)
}

/// Delays after 1..=`failures` consecutive failures.
pub fn curve(policy: &SchedulePolicy, failures: u32) -> Vec<(u32, Duration)> {
    (1..=failures).map(|n| (n, policy.backoff_for(n))).collect()
}

/// Runs the backoff command.
pub fn run(failures: u32, initial_secs: u64, max_secs: u64, multiplier: f64, jitter: bool) {
    let policy = policy(initial_secs, max_secs, multiplier, jitter);

    println!("Retry delays");
    println!("============");
    println!("  min interval: {:?}", policy.min_interval);
    println!("  max backoff:  {:?}", policy.max_backoff);
    println!();
    println!("  {:>8}  {:>12}", "Failures", "Delay");
    for (n, delay) in curve(&policy, failures) {
        println!("  {:>8}  {:>12}", n, format!("{:.1}s", delay.as_secs_f64()));
    }
}
