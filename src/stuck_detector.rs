use std::time::{Duration, SystemTime};

use alloy::primitives::B256;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::config::TxmConfig;
use crate::types::Transaction;

#[derive(Debug, Error)]
pub enum StuckTxDetectorError {
    #[error("detection api url is not configured")]
    MissingDetectionApiUrl,

    #[error("status api request for attempt {hash} failed: {source}")]
    Request {
        hash: B256,
        #[source]
        source: reqwest::Error,
    },

    #[error("status api response for attempt {hash} could not be decoded: {source}")]
    Decode {
        hash: B256,
        #[source]
        source: serde_json::Error,
    },
}

/// Closed set of chain behaviors for stuck detection. Selected once at
/// construction; there is no open-ended dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainType {
    /// Time-based detection only.
    Default,
    /// Chains that broadcast through a second path expose a status API which
    /// is polled per attempt before falling back to the time-based rule.
    DualBroadcast,
}

/// Per-attempt verdict reported by the dual-broadcast status API. Any
/// unrecognized status string decodes as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Pending,
    Included,
    Failed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: AttemptStatus,
    #[allow(dead_code)]
    hash: B256,
}

/// Stateless decision function consulted by operational retry policy to
/// decide whether a transaction should be abandoned and replaced.
pub struct StuckTxDetector {
    chain_type: ChainType,
    block_time: Duration,
    stuck_tx_block_threshold: u32,
    detection_api_url: Option<Url>,
    http: reqwest::Client,
}

impl StuckTxDetector {
    pub fn new(chain_type: ChainType, config: &TxmConfig) -> Self {
        Self {
            chain_type,
            block_time: config.block_time,
            stuck_tx_block_threshold: config.stuck_tx_block_threshold,
            detection_api_url: config.detection_api_url.clone(),
            http: reqwest::Client::new(),
        }
    }

    /// Returns whether the transaction should be considered stuck. For
    /// dual-broadcast chains the status API is polled once per attempt hash
    /// first; a conclusive per-attempt verdict short-circuits the time-based
    /// fallback. Transport and decode failures surface as errors rather than
    /// a "not stuck" verdict.
    pub async fn detect_stuck_transaction(
        &self,
        tx: &Transaction,
    ) -> Result<bool, StuckTxDetectorError> {
        match self.chain_type {
            ChainType::Default => Ok(self.detect_by_time(tx)),
            ChainType::DualBroadcast => {
                if let Some(verdict) = self.detect_by_status_api(tx).await? {
                    return Ok(verdict);
                }
                Ok(self.detect_by_time(tx))
            }
        }
    }

    /// A transaction is stuck once it has been broadcast at least once and
    /// has seen no activity for more than `block_time *
    /// stuck_tx_block_threshold`. A never-broadcast transaction is never
    /// stuck under this rule.
    fn detect_by_time(&self, tx: &Transaction) -> bool {
        let Some(last_broadcast_at) = tx.last_broadcast_at else {
            return false;
        };
        let threshold = self.block_time * self.stuck_tx_block_threshold;
        SystemTime::now()
            .duration_since(last_broadcast_at)
            .map(|elapsed| elapsed > threshold)
            .unwrap_or(false)
    }

    async fn detect_by_status_api(
        &self,
        tx: &Transaction,
    ) -> Result<Option<bool>, StuckTxDetectorError> {
        let base_url = self
            .detection_api_url
            .as_ref()
            .ok_or(StuckTxDetectorError::MissingDetectionApiUrl)?;

        for attempt in &tx.attempts {
            let url = format!("{base_url}{hash}", hash = attempt.hash);
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|source| StuckTxDetectorError::Request {
                    hash: attempt.hash,
                    source,
                })?;
            let body = response
                .text()
                .await
                .map_err(|source| StuckTxDetectorError::Request {
                    hash: attempt.hash,
                    source,
                })?;
            let status: StatusResponse =
                serde_json::from_str(&body).map_err(|source| StuckTxDetectorError::Decode {
                    hash: attempt.hash,
                    source,
                })?;

            match status.status {
                AttemptStatus::Pending | AttemptStatus::Included => return Ok(Some(false)),
                AttemptStatus::Failed | AttemptStatus::Cancelled => {
                    tracing::debug!(
                        tx_id = tx.id,
                        attempt_hash = %attempt.hash,
                        status = ?status.status,
                        "status api reported a terminal attempt status"
                    );
                    return Ok(Some(true));
                }
                AttemptStatus::Unknown => continue,
            }
        }

        Ok(None)
    }
}
