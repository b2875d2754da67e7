//! Protocol constants for admission control.
//!
//! These are protocol-visible and must match across nodes.

use std::time::Duration;

/// Smallest denomination of the chain's native token.
pub const BASE_UNIT: u128 = 1_000_000_000_000_000_000;

/// Deposit required to become an rnode, in whole tokens.
pub const MIN_RNODE_FUND_UNITS: u128 = 200_000;

/// Configuration for [`AdmissionControl`](crate::AdmissionControl).
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Fewest terms a campaign may cover.
    pub min_terms: u64,
    /// Most terms a campaign may cover.
    pub max_terms: u64,
    /// Deposit value for the join transaction.
    pub min_rnode_fund: u128,
    /// How often the funding watcher polls for the receipt.
    pub funding_poll_interval: Duration,
    /// Overall bound on the funding receipt wait.
    pub funding_timeout: Duration,
    /// Campaign contract version submitted with every claim.
    pub contract_version: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_terms: 1,
            max_terms: 10,
            min_rnode_fund: MIN_RNODE_FUND_UNITS * BASE_UNIT,
            funding_poll_interval: Duration::from_millis(500),
            funding_timeout: Duration::from_secs(30),
            contract_version: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = AdmissionConfig::default();
        assert_eq!(config.min_terms, 1);
        assert_eq!(config.max_terms, 10);
        assert_eq!(config.funding_poll_interval, Duration::from_millis(500));
        assert_eq!(config.funding_timeout, Duration::from_secs(30));
        assert_eq!(config.min_rnode_fund, 200_000 * BASE_UNIT);
    }
}
