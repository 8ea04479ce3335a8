//! Metric names and descriptions.
//!
//! Values are recorded inline with the `metrics` macros where things happen,
//! always through the names below; this module also registers their
//! descriptions with whatever recorder is installed.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

pub const DISCOVERY_TOTAL: &str = "balancer_discovery_total";
pub const DISCOVERY_DURATION: &str = "balancer_discovery_duration_seconds";
pub const PESSIMIZATIONS_TOTAL: &str = "balancer_pessimizations_total";
pub const FORCED_REDISCOVERIES_TOTAL: &str = "balancer_forced_rediscoveries_total";
pub const NO_ENDPOINTS_TOTAL: &str = "balancer_no_endpoints_total";
pub const CONNECTIONS: &str = "balancer_connections";
pub const PREFERRED_CONNECTIONS: &str = "balancer_preferred_connections";
pub const CALL_DURATION: &str = "balancer_call_duration_seconds";
pub const RETRY_ATTEMPTS_TOTAL: &str = "balancer_retry_attempts_total";
pub const LOCALITY_PROBE_DURATION: &str = "balancer_locality_probe_duration_seconds";

pub const POOL_CREATED: &str = "connection_pool_created";
pub const POOL_REUSED: &str = "connection_pool_reused";
pub const POOL_BANS_TOTAL: &str = "connection_pool_bans_total";
pub const POOL_ALLOWS_TOTAL: &str = "connection_pool_allows_total";
pub const POOL_CONNECTIONS: &str = "connection_pool_connections";
pub const POOL_BANNED_CONNECTIONS: &str = "connection_pool_banned_connections";

pub const REPEATER_RUNS_TOTAL: &str = "repeater_runs_total";
pub const REPEATER_FORCED_TOTAL: &str = "repeater_forced_total";

/// Register descriptions for every metric this crate emits
pub fn describe_metrics() {
    describe_counter!(DISCOVERY_TOTAL, "Discovery attempts by outcome");
    describe_histogram!(DISCOVERY_DURATION, Unit::Seconds, "Duration of one discovery attempt");
    describe_counter!(PESSIMIZATIONS_TOTAL, "Connections banned after a failed call");
    describe_counter!(FORCED_REDISCOVERIES_TOTAL, "Out-of-band rediscoveries requested by selection");
    describe_counter!(NO_ENDPOINTS_TOTAL, "Calls rejected because no connection was selectable");
    describe_gauge!(CONNECTIONS, "Connections in the current snapshot");
    describe_gauge!(PREFERRED_CONNECTIONS, "Connections in the preferred tier of the current snapshot");
    describe_histogram!(CALL_DURATION, Unit::Seconds, "Duration of dispatched calls by outcome");
    describe_counter!(RETRY_ATTEMPTS_TOTAL, "Retries performed by the retry policy");
    describe_histogram!(LOCALITY_PROBE_DURATION, Unit::Seconds, "Time to the first successful locality probe");

    describe_counter!(POOL_CREATED, "Connections created by the pool");
    describe_counter!(POOL_REUSED, "Pool lookups served by an existing connection");
    describe_counter!(POOL_BANS_TOTAL, "Connections moved to the banned state");
    describe_counter!(POOL_ALLOWS_TOTAL, "Banned connections allowed again");
    describe_gauge!(POOL_CONNECTIONS, "Connections held by the pool");
    describe_gauge!(POOL_BANNED_CONNECTIONS, "Pooled connections currently banned");

    describe_counter!(REPEATER_RUNS_TOTAL, "Background task runs by trigger and outcome");
    describe_counter!(REPEATER_FORCED_TOTAL, "Immediate runs requested from a repeater");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_without_recorder() {
        describe_metrics();
    }

    #[test]
    fn test_metric_names_are_distinct() {
        let names = [
            DISCOVERY_TOTAL,
            DISCOVERY_DURATION,
            PESSIMIZATIONS_TOTAL,
            FORCED_REDISCOVERIES_TOTAL,
            NO_ENDPOINTS_TOTAL,
            CONNECTIONS,
            PREFERRED_CONNECTIONS,
            CALL_DURATION,
            RETRY_ATTEMPTS_TOTAL,
            LOCALITY_PROBE_DURATION,
            POOL_CREATED,
            POOL_REUSED,
            POOL_BANS_TOTAL,
            POOL_ALLOWS_TOTAL,
            POOL_CONNECTIONS,
            POOL_BANNED_CONNECTIONS,
            REPEATER_RUNS_TOTAL,
            REPEATER_FORCED_TOTAL,
        ];
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }
}
