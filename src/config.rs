use std::time::Duration;

use url::Url;

/// Configuration surface of the control loop and stuck-transaction detector.
#[derive(Debug, Clone)]
pub struct TxmConfig {
    /// Expected chain block time; drives the backfill tick and time-based
    /// stuck detection.
    pub block_time: Duration,
    /// Blocks of broadcast inactivity before the retry policy defers the
    /// next broadcast attempt.
    pub retry_block_threshold: u32,
    /// Blocks of inactivity before a broadcast transaction is declared stuck.
    pub stuck_tx_block_threshold: u32,
    /// Base URL for dual-broadcast status polling. Required only for
    /// [`ChainType::DualBroadcast`](crate::stuck_detector::ChainType).
    pub detection_api_url: Option<Url>,
    /// Capacity of the unstarted queue and the confirmed partition.
    pub max_queued_transactions: usize,
    /// Denominator of the fraction evicted when the confirmed partition is
    /// full: a value of 3 prunes the lowest-nonce third.
    pub prune_subset: usize,
    /// Maximum concurrently unconfirmed transactions per address before
    /// broadcast is paused.
    pub max_in_flight_transactions: usize,
    /// Once the unconfirmed count exceeds `max_in_flight_transactions`
    /// divided by this, the local nonce is reconciled against the chain's
    /// pending nonce before assigning a new one.
    pub in_flight_reconcile_divisor: usize,
}

impl Default for TxmConfig {
    fn default() -> Self {
        Self {
            block_time: Duration::from_secs(12),
            retry_block_threshold: 10,
            stuck_tx_block_threshold: 10,
            detection_api_url: None,
            max_queued_transactions: 250,
            prune_subset: 3,
            max_in_flight_transactions: 16,
            in_flight_reconcile_divisor: 3,
        }
    }
}
