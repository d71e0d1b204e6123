use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Attempt, Transaction};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("rpc error (code {code}): {message}")]
    Rpc { code: i64, message: String },
}

/// Chain RPC surface the control loop consumes.
///
/// Only three calls are needed: the pending nonce (startup and high
/// in-flight load reconciliation), the latest confirmed nonce (every
/// backfill tick) and raw transaction broadcast.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Next nonce as seen by the chain's mempool.
    async fn pending_nonce(&self, address: Address) -> Result<u64, ClientError>;

    /// Next nonce implied by the latest confirmed block; authoritative input
    /// for confirmation and reorg repair.
    async fn latest_nonce(&self, address: Address) -> Result<u64, ClientError>;

    async fn send_transaction(&self, signed_payload: &Bytes) -> Result<(), ClientError>;
}

#[derive(Debug, Error)]
pub enum AttemptBuilderError {
    #[error("fee estimation failed: {message}")]
    FeeEstimation { message: String },

    #[error("signing failed: {message}")]
    Signing { message: String },
}

/// Signing collaborator: turns a nonce-assigned transaction into a signed
/// attempt with appropriate fee parameters, ready to broadcast. Fee bumping
/// strategy and signing algorithms live behind this seam.
#[async_trait]
pub trait AttemptBuilder: Send + Sync + 'static {
    async fn new_attempt(&self, tx: &Transaction) -> Result<Attempt, AttemptBuilderError>;
}
