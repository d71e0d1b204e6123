pub mod in_memory;
pub mod manager;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Attempt, Transaction, TransactionRequest};

pub use in_memory::InMemoryStore;
pub use manager::InMemoryStoreManager;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store for address {address} not found")]
    StoreNotFound { address: Address },

    #[error("addresses already registered in store manager: {}", format_addresses(.addresses))]
    AddressesAlreadyRegistered { addresses: Vec<Address> },

    #[error("a {state} transaction already occupies nonce {nonce} (tx id: {existing_tx_id})")]
    NonceOccupied {
        nonce: u64,
        state: crate::types::TxState,
        existing_tx_id: u64,
    },

    #[error(
        "unconfirmed transaction at nonce {nonce} has tx id {found_tx_id}, attempt points to tx id {attempt_tx_id}"
    )]
    AttemptTxIdMismatch {
        nonce: u64,
        found_tx_id: u64,
        attempt_tx_id: u64,
    },

    #[error("unconfirmed transaction was not found for nonce {nonce}")]
    UnconfirmedTxNotFound { nonce: u64 },

    #[error("transaction with id {tx_id} was not found")]
    TransactionNotFound { tx_id: u64 },

    #[error("attempt with hash {hash} for tx id {tx_id} was not found")]
    AttemptNotFound { tx_id: u64, hash: B256 },

    #[error("nonce for tx id {tx_id} is empty")]
    MissingNonce { tx_id: u64 },

    #[error("transaction with id {tx_id} cannot transition to fatal from state {state}")]
    InvalidFatalTransition {
        tx_id: u64,
        state: crate::types::TxState,
    },

    /// Escape hatch for durable backends (database/transport failures).
    #[error("storage backend error: {message}")]
    Backend { message: String },
}

fn format_addresses(addresses: &[Address]) -> String {
    let joined: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
    joined.join(", ")
}

/// Storage contract the control loop depends on.
///
/// Implemented by [`InMemoryStoreManager`] and by durable backends that
/// persist the same state to a transaction/attempt table pair. Every
/// operation is scoped to a sending address; an unmanaged address yields
/// [`StoreError::StoreNotFound`].
#[async_trait]
pub trait TxStore: Send + Sync + 'static {
    /// Force-transitions every unstarted and unconfirmed transaction to
    /// fatal. Confirmed and already-fatal transactions are untouched.
    async fn abandon_pending_transactions(&self, address: Address) -> Result<(), StoreError>;

    /// Appends an attempt to the unconfirmed transaction at its nonce. The
    /// attempt must reference the transaction currently stored there.
    async fn append_attempt_to_transaction(
        &self,
        address: Address,
        nonce: u64,
        attempt: Attempt,
    ) -> Result<(), StoreError>;

    async fn count_unstarted_transactions(&self, address: Address) -> Result<usize, StoreError>;

    /// Inserts a placeholder unconfirmed transaction at `nonce` to fill a
    /// nonce gap. Fails if the nonce is occupied in either the unconfirmed
    /// or the confirmed partition.
    async fn create_empty_unconfirmed_transaction(
        &self,
        address: Address,
        nonce: u64,
        gas_limit: u64,
    ) -> Result<Transaction, StoreError>;

    /// Creates a new unstarted transaction. Never blocks and never fails on
    /// a full queue; the oldest queued transaction is evicted instead.
    async fn create_transaction(
        &self,
        request: TransactionRequest,
    ) -> Result<Transaction, StoreError>;

    /// Removes one attempt by hash from an unconfirmed transaction, e.g.
    /// after a failed network broadcast.
    async fn delete_attempt_for_unconfirmed_tx(
        &self,
        address: Address,
        nonce: u64,
        attempt: &Attempt,
    ) -> Result<(), StoreError>;

    /// Returns the unconfirmed transaction at `nonce` (if any) together with
    /// the total unconfirmed count. The count is returned even when no
    /// transaction exists at that nonce, so the caller can make in-flight-cap
    /// decisions independent of the lookup.
    async fn fetch_unconfirmed_transaction_at_nonce_with_count(
        &self,
        address: Address,
        nonce: u64,
    ) -> Result<(Option<Transaction>, usize), StoreError>;

    /// Returns the first-created transaction (in any partition) whose
    /// idempotency key matches.
    async fn find_tx_with_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Promotes every unconfirmed transaction with nonce strictly below
    /// `latest_nonce` to confirmed, and demotes every confirmed transaction
    /// with nonce at or above it back to unconfirmed (reorg repair), clearing
    /// its broadcast timestamps. Returns the sorted ids of confirmed and
    /// re-unconfirmed transactions.
    async fn mark_transactions_confirmed(
        &self,
        address: Address,
        latest_nonce: u64,
    ) -> Result<(Vec<u64>, Vec<u64>), StoreError>;

    /// Moves a non-terminal transaction to the fatal partition.
    async fn mark_transaction_fatal(&self, address: Address, tx_id: u64)
    -> Result<(), StoreError>;

    async fn mark_unconfirmed_transaction_purgeable(
        &self,
        address: Address,
        nonce: u64,
    ) -> Result<(), StoreError>;

    /// Stamps the transaction and the matching attempt with the same
    /// broadcast instant.
    async fn update_transaction_broadcast(
        &self,
        address: Address,
        tx_id: u64,
        nonce: u64,
        attempt_hash: B256,
    ) -> Result<(), StoreError>;

    /// Pops the oldest unstarted transaction, assigns it `nonce` and moves it
    /// to the unconfirmed partition. Returns `Ok(None)` when the unstarted
    /// queue is empty; fails if the nonce is already occupied.
    async fn update_unstarted_transaction_with_nonce(
        &self,
        address: Address,
        nonce: u64,
    ) -> Result<Option<Transaction>, StoreError>;
}
