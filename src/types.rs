use std::fmt;
use std::time::SystemTime;

use alloy::primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreError;

/// Lifecycle state of a transaction.
///
/// `Unstarted -> Unconfirmed -> Confirmed -> Finalized` is the happy path.
/// A reorg moves `Confirmed` back to `Unconfirmed`. `FatalError` is terminal
/// and reachable from `Unstarted` and `Unconfirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Unstarted,
    Unconfirmed,
    Confirmed,
    /// Only ever assigned by durable backends that track finality depth.
    Finalized,
    FatalError,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxState::Unstarted => "unstarted",
            TxState::Unconfirmed => "unconfirmed",
            TxState::Confirmed => "confirmed",
            TxState::Finalized => "finalized",
            TxState::FatalError => "fatal",
        };
        f.write_str(s)
    }
}

/// Fee parameters of one signed attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeParams {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// One concrete signed broadcast of a transaction.
///
/// Attempt ids are only unique within their parent transaction; any global
/// lookup must go through `(tx_id, id)` or the attempt hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub id: u64,
    pub tx_id: u64,
    pub hash: B256,
    pub fee: FeeParams,
    pub gas_limit: u64,
    pub tx_type: u8,
    pub signed_payload: Bytes,
    pub created_at: SystemTime,
    pub broadcast_at: Option<SystemTime>,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempt {{ id: {}, tx_id: {}, hash: {}, gas_limit: {}, tx_type: {} }}",
            self.id, self.tx_id, self.hash, self.gas_limit, self.tx_type
        )
    }
}

/// Correlation attributes tying a transaction back to the job pipeline that
/// requested it. Carried through the store untouched; callback bookkeeping
/// stays with the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCorrelation {
    pub task_run_id: Option<Uuid>,
    pub min_confirmations: Option<u32>,
    pub signal_callback: bool,
}

/// One logical intent to execute on-chain.
///
/// The store owns the canonical copy; every value that leaves the store is a
/// deep copy (`Clone` here clones the attempts too), so callers can never
/// mutate stored state through a returned transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: u64,
    pub idempotency_key: Option<String>,
    pub chain_id: u64,
    /// Absent while unstarted. Fixed once assigned, never reassigned.
    pub nonce: Option<u64>,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: u64,

    pub created_at: SystemTime,
    pub initial_broadcast_at: Option<SystemTime>,
    pub last_broadcast_at: Option<SystemTime>,

    pub state: TxState,
    pub is_purgeable: bool,
    pub attempts: Vec<Attempt>,
    /// Strictly kept in memory to bound retries; never persisted.
    #[serde(skip)]
    pub attempt_count: u16,
    pub pipeline: Option<PipelineCorrelation>,
    /// Free-form caller metadata, passed through untouched.
    pub meta: Option<serde_json::Value>,
}

impl Transaction {
    pub fn find_attempt_by_hash(&self, hash: B256) -> Result<&Attempt, StoreError> {
        self.attempts
            .iter()
            .find(|a| a.hash == hash)
            .ok_or(StoreError::AttemptNotFound {
                tx_id: self.id,
                hash,
            })
    }

    pub fn find_attempt_by_hash_mut(&mut self, hash: B256) -> Result<&mut Attempt, StoreError> {
        let tx_id = self.id;
        self.attempts
            .iter_mut()
            .find(|a| a.hash == hash)
            .ok_or(StoreError::AttemptNotFound { tx_id, hash })
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tx {{ id: {}, from: {}, nonce: {:?}, state: {}, attempts: {} }}",
            self.id,
            self.from,
            self.nonce,
            self.state,
            self.attempts.len()
        )
    }
}

/// Caller-facing request to create a new transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    /// Caller-supplied token for at-most-once creation across retried requests.
    pub idempotency_key: Option<String>,
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: u64,
    pub pipeline: Option<PipelineCorrelation>,
    pub meta: Option<serde_json::Value>,
}
