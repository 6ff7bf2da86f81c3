//! Whether another run of a chain config may start.

use cadence_pgengine::ChainConfig;

/// `max_instances = 0` means unbounded; otherwise proceed while fewer than
/// `max_instances` runs are `STARTED`.
pub fn can_proceed_chain_execution(running: i64, max_instances: i64) -> bool {
    max_instances == 0 || running < max_instances
}

/// The limit that applies to `config`; exclusive configs allow one run.
pub fn effective_max_instances(config: &ChainConfig) -> i64 {
    if config.exclusive_execution {
        1
    } else {
        i64::from(config.max_instances)
    }
}

/// Store connections kept free of chain transactions: the poll loop and the
/// short status and log writes of running chains.
pub const RESERVED_CONNECTIONS: u32 = 2;

/// Chains that may hold a local transaction at once with a pool of
/// `max_connections`.
pub fn max_parallel_chains(max_connections: u32) -> usize {
    max_connections.saturating_sub(RESERVED_CONNECTIONS).max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(exclusive: bool, max_instances: i32) -> ChainConfig {
        ChainConfig {
            config_id: 1,
            chain_id: 1,
            chain_name: "nightly".into(),
            self_destruct: false,
            exclusive_execution: exclusive,
            max_instances,
        }
    }

    #[test]
    fn zero_maximum_is_unbounded() {
        assert!(can_proceed_chain_execution(0, 0));
        assert!(can_proceed_chain_execution(1_000, 0));
    }

    #[test]
    fn running_below_maximum_proceeds() {
        assert!(can_proceed_chain_execution(0, 1));
        assert!(can_proceed_chain_execution(15, 16));
        assert!(!can_proceed_chain_execution(16, 16));
        assert!(!can_proceed_chain_execution(17, 16));
    }

    #[test]
    fn exclusive_config_admits_a_single_run() {
        let exclusive = config(true, 16);
        assert_eq!(effective_max_instances(&exclusive), 1);
        assert!(can_proceed_chain_execution(0, effective_max_instances(&exclusive)));
        assert!(!can_proceed_chain_execution(1, effective_max_instances(&exclusive)));
    }

    #[test]
    fn exclusive_overrides_an_unbounded_maximum() {
        assert_eq!(effective_max_instances(&config(true, 0)), 1);
        assert_eq!(effective_max_instances(&config(false, 0)), 0);
    }

    #[test]
    fn chains_leave_room_for_polling_and_status_writes() {
        assert_eq!(max_parallel_chains(10), 8);
        assert_eq!(max_parallel_chains(3), 1);
    }

    #[test]
    fn tiny_pools_still_run_one_chain() {
        assert_eq!(max_parallel_chains(2), 1);
        assert_eq!(max_parallel_chains(0), 1);
    }
}
