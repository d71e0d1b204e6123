use std::collections::{BTreeMap, VecDeque};
use std::sync::RwLock;
use std::time::SystemTime;

use alloy::primitives::{Address, B256, Bytes, U256};

use crate::store::StoreError;
use crate::types::{Attempt, Transaction, TransactionRequest, TxState};

/// Four logical partitions per address. A transaction lives in exactly one of
/// them at any instant; the partitions are never exposed by reference.
#[derive(Debug, Default)]
struct Partitions {
    next_tx_id: u64,
    unstarted: VecDeque<Transaction>,
    unconfirmed: BTreeMap<u64, Transaction>,
    confirmed: BTreeMap<u64, Transaction>,
    fatal: Vec<Transaction>,
}

/// Bounded, lock-protected transaction state for one sending address.
///
/// Transaction ids are monotonic and scoped to this store instance, issued
/// under the same lock that guards partition mutation. Every read returns a
/// deep copy of the stored record.
#[derive(Debug)]
pub struct InMemoryStore {
    address: Address,
    chain_id: u64,
    max_queued_transactions: usize,
    prune_subset: usize,
    inner: RwLock<Partitions>,
}

impl InMemoryStore {
    pub fn new(
        address: Address,
        chain_id: u64,
        max_queued_transactions: usize,
        prune_subset: usize,
    ) -> Self {
        Self {
            address,
            chain_id,
            max_queued_transactions,
            prune_subset,
            inner: RwLock::new(Partitions::default()),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Force-transitions every unstarted and unconfirmed transaction to
    /// fatal. Confirmed and already-fatal transactions are untouched.
    pub fn abandon_pending_transactions(&self) {
        let mut inner = self.inner.write().expect("store lock poisoned");

        let unstarted = std::mem::take(&mut inner.unstarted);
        for mut tx in unstarted {
            tx.state = TxState::FatalError;
            inner.fatal.push(tx);
        }

        let unconfirmed = std::mem::take(&mut inner.unconfirmed);
        for (_, mut tx) in unconfirmed {
            tx.state = TxState::FatalError;
            inner.fatal.push(tx);
        }
    }

    /// Appends an attempt to the unconfirmed transaction at `nonce`. The
    /// attempt's parent id must match the transaction stored there. The store
    /// assigns the attempt id (unique only within the parent transaction) and
    /// the creation timestamp.
    pub fn append_attempt_to_transaction(
        &self,
        nonce: u64,
        mut attempt: Attempt,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");

        let tx = inner
            .unconfirmed
            .get_mut(&nonce)
            .ok_or(StoreError::UnconfirmedTxNotFound { nonce })?;

        if tx.id != attempt.tx_id {
            return Err(StoreError::AttemptTxIdMismatch {
                nonce,
                found_tx_id: tx.id,
                attempt_tx_id: attempt.tx_id,
            });
        }

        // Attempts are not collectively tracked, so ids restart per transaction.
        attempt.id = tx.attempts.len() as u64;
        attempt.created_at = SystemTime::now();
        tx.attempt_count += 1;
        tx.attempts.push(attempt);

        Ok(())
    }

    pub fn count_unstarted_transactions(&self) -> usize {
        self.inner.read().expect("store lock poisoned").unstarted.len()
    }

    /// Inserts a placeholder unconfirmed transaction directly at `nonce`,
    /// used to fill nonce gaps. The nonce must be free in both the
    /// unconfirmed and the confirmed partition.
    pub fn create_empty_unconfirmed_transaction(
        &self,
        nonce: u64,
        gas_limit: u64,
    ) -> Result<Transaction, StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");

        if let Some(existing) = inner.unconfirmed.get(&nonce) {
            return Err(StoreError::NonceOccupied {
                nonce,
                state: TxState::Unconfirmed,
                existing_tx_id: existing.id,
            });
        }
        if let Some(existing) = inner.confirmed.get(&nonce) {
            return Err(StoreError::NonceOccupied {
                nonce,
                state: TxState::Confirmed,
                existing_tx_id: existing.id,
            });
        }

        inner.next_tx_id += 1;
        let tx = Transaction {
            id: inner.next_tx_id,
            idempotency_key: None,
            chain_id: self.chain_id,
            nonce: Some(nonce),
            from: self.address,
            to: Address::ZERO,
            value: U256::ZERO,
            data: Bytes::new(),
            gas_limit,
            created_at: SystemTime::now(),
            initial_broadcast_at: None,
            last_broadcast_at: None,
            state: TxState::Unconfirmed,
            is_purgeable: false,
            attempts: Vec::new(),
            attempt_count: 0,
            pipeline: None,
            meta: None,
        };

        let copy = tx.clone();
        inner.unconfirmed.insert(nonce, tx);
        Ok(copy)
    }

    /// Creates a new unstarted transaction with a fresh id. Never fails: if
    /// the unstarted queue is at capacity the single oldest entry is evicted
    /// first.
    pub fn create_transaction(&self, request: TransactionRequest) -> Transaction {
        let mut inner = self.inner.write().expect("store lock poisoned");

        if inner.unstarted.len() == self.max_queued_transactions {
            // FIFO eviction keeps creation non-blocking for the caller.
            if let Some(dropped) = inner.unstarted.pop_front() {
                tracing::warn!(
                    address = %self.address,
                    limit = self.max_queued_transactions,
                    dropped_tx_id = dropped.id,
                    "unstarted transactions queue reached max limit, dropping oldest transaction"
                );
            }
        }

        inner.next_tx_id += 1;
        let tx = Transaction {
            id: inner.next_tx_id,
            idempotency_key: request.idempotency_key,
            chain_id: self.chain_id,
            nonce: None,
            from: self.address,
            to: request.to,
            value: request.value,
            data: request.data,
            gas_limit: request.gas_limit,
            created_at: SystemTime::now(),
            initial_broadcast_at: None,
            last_broadcast_at: None,
            state: TxState::Unstarted,
            is_purgeable: false,
            attempts: Vec::new(),
            attempt_count: 0,
            pipeline: request.pipeline,
            meta: request.meta,
        };

        let copy = tx.clone();
        inner.unstarted.push_back(tx);
        copy
    }

    /// Removes one attempt by hash from an unconfirmed transaction, e.g.
    /// after a failed network broadcast.
    pub fn delete_attempt_for_unconfirmed_tx(
        &self,
        nonce: u64,
        attempt: &Attempt,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");

        let tx = inner
            .unconfirmed
            .get_mut(&nonce)
            .ok_or(StoreError::UnconfirmedTxNotFound { nonce })?;

        let index = tx
            .attempts
            .iter()
            .position(|a| a.hash == attempt.hash)
            .ok_or(StoreError::AttemptNotFound {
                tx_id: attempt.tx_id,
                hash: attempt.hash,
            })?;
        tx.attempts.remove(index);

        Ok(())
    }

    /// Returns the unconfirmed transaction at `nonce` (if any) together with
    /// the total unconfirmed count. The count is meaningful even when the
    /// nonce lookup misses.
    pub fn fetch_unconfirmed_transaction_at_nonce_with_count(
        &self,
        nonce: u64,
    ) -> (Option<Transaction>, usize) {
        let inner = self.inner.read().expect("store lock poisoned");
        (inner.unconfirmed.get(&nonce).cloned(), inner.unconfirmed.len())
    }

    /// Linear scan across all partitions; the first-created match (lowest id)
    /// wins, so retried creation requests resolve deterministically.
    pub fn find_tx_with_idempotency_key(&self, key: &str) -> Option<Transaction> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .unstarted
            .iter()
            .chain(inner.unconfirmed.values())
            .chain(inner.confirmed.values())
            .chain(inner.fatal.iter())
            .filter(|tx| tx.idempotency_key.as_deref() == Some(key))
            .min_by_key(|tx| tx.id)
            .cloned()
    }

    /// Reconciles local state against the chain's authoritative latest nonce:
    /// unconfirmed transactions below it are promoted to confirmed, confirmed
    /// transactions at or above it are demoted back to unconfirmed (reorg)
    /// with their broadcast timestamps cleared. Returns the sorted ids of the
    /// promoted and demoted transactions. Prunes the confirmed partition when
    /// it is at or over capacity.
    pub fn mark_transactions_confirmed(&self, latest_nonce: u64) -> (Vec<u64>, Vec<u64>) {
        let mut inner = self.inner.write().expect("store lock poisoned");

        let mut confirmed_ids = Vec::new();
        let promoted: Vec<u64> = inner.unconfirmed.range(..latest_nonce).map(|(n, _)| *n).collect();
        for nonce in promoted {
            if let Some(mut tx) = inner.unconfirmed.remove(&nonce) {
                tx.state = TxState::Confirmed;
                confirmed_ids.push(tx.id);
                inner.confirmed.insert(nonce, tx);
            }
        }

        let mut unconfirmed_ids = Vec::new();
        let demoted: Vec<u64> = inner.confirmed.range(latest_nonce..).map(|(n, _)| *n).collect();
        for nonce in demoted {
            if let Some(mut tx) = inner.confirmed.remove(&nonce) {
                tx.state = TxState::Unconfirmed;
                // A reorged transaction must look as if it was never broadcast.
                tx.last_broadcast_at = None;
                tx.initial_broadcast_at = None;
                unconfirmed_ids.push(tx.id);
                inner.unconfirmed.insert(nonce, tx);
            }
        }

        if inner.confirmed.len() >= self.max_queued_transactions {
            let pruned_tx_ids = Self::prune_confirmed_transactions(&mut inner, self.prune_subset);
            tracing::debug!(
                address = %self.address,
                limit = self.max_queued_transactions,
                pruned = pruned_tx_ids.len(),
                pruned_tx_ids = ?pruned_tx_ids,
                "confirmed transactions reached max limit, pruned oldest nonces"
            );
        }

        confirmed_ids.sort_unstable();
        unconfirmed_ids.sort_unstable();
        (confirmed_ids, unconfirmed_ids)
    }

    /// Moves a transaction out of the unstarted or unconfirmed partition into
    /// the fatal partition.
    pub fn mark_transaction_fatal(&self, tx_id: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");

        if let Some(index) = inner.unstarted.iter().position(|tx| tx.id == tx_id) {
            let mut tx = inner.unstarted.remove(index).expect("index in bounds");
            tx.state = TxState::FatalError;
            inner.fatal.push(tx);
            return Ok(());
        }

        if let Some(nonce) = inner
            .unconfirmed
            .iter()
            .find(|(_, tx)| tx.id == tx_id)
            .map(|(nonce, _)| *nonce)
        {
            let mut tx = inner.unconfirmed.remove(&nonce).expect("nonce present");
            tx.state = TxState::FatalError;
            inner.fatal.push(tx);
            return Ok(());
        }

        if let Some(tx) = inner
            .confirmed
            .values()
            .chain(inner.fatal.iter())
            .find(|tx| tx.id == tx_id)
        {
            return Err(StoreError::InvalidFatalTransition {
                tx_id,
                state: tx.state,
            });
        }

        Err(StoreError::TransactionNotFound { tx_id })
    }

    pub fn mark_unconfirmed_transaction_purgeable(&self, nonce: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");

        let tx = inner
            .unconfirmed
            .get_mut(&nonce)
            .ok_or(StoreError::UnconfirmedTxNotFound { nonce })?;
        tx.is_purgeable = true;

        Ok(())
    }

    /// Stamps the transaction and the matching attempt with the same
    /// broadcast instant.
    pub fn update_transaction_broadcast(
        &self,
        tx_id: u64,
        nonce: u64,
        attempt_hash: B256,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");

        let tx = inner
            .unconfirmed
            .get_mut(&nonce)
            .ok_or(StoreError::UnconfirmedTxNotFound { nonce })?;
        if tx.id != tx_id {
            return Err(StoreError::TransactionNotFound { tx_id });
        }

        let now = SystemTime::now();
        tx.last_broadcast_at = Some(now);
        if tx.initial_broadcast_at.is_none() {
            tx.initial_broadcast_at = Some(now);
        }
        let attempt = tx.find_attempt_by_hash_mut(attempt_hash)?;
        attempt.broadcast_at = Some(now);

        Ok(())
    }

    /// Pops the oldest unstarted transaction, assigns it `nonce` and moves it
    /// to the unconfirmed partition. An empty queue is a no-op, not an error.
    pub fn update_unstarted_transaction_with_nonce(
        &self,
        nonce: u64,
    ) -> Result<Option<Transaction>, StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");

        if inner.unstarted.is_empty() {
            tracing::debug!(address = %self.address, "unstarted transactions queue is empty");
            return Ok(None);
        }

        if let Some(existing) = inner.unconfirmed.get(&nonce) {
            return Err(StoreError::NonceOccupied {
                nonce,
                state: TxState::Unconfirmed,
                existing_tx_id: existing.id,
            });
        }

        let mut tx = inner.unstarted.pop_front().expect("queue is non-empty");
        tx.nonce = Some(nonce);
        tx.state = TxState::Unconfirmed;

        let copy = tx.clone();
        inner.unconfirmed.insert(nonce, tx);
        Ok(Some(copy))
    }

    // Caller holds the write lock.
    fn prune_confirmed_transactions(inner: &mut Partitions, prune_subset: usize) -> Vec<u64> {
        if inner.confirmed.is_empty() {
            return Vec::new();
        }

        let held_nonces: Vec<u64> = inner.confirmed.keys().copied().collect();
        // A subset of 0 or 1 puts the cut past the highest held nonce and
        // degenerates to evicting the whole partition.
        let cut_index = held_nonces
            .len()
            .checked_div(prune_subset)
            .unwrap_or(held_nonces.len());

        let pruned = if let Some(&min_nonce) = held_nonces.get(cut_index) {
            // split_off keeps everything >= min_nonce; the remainder is evicted.
            let kept = inner.confirmed.split_off(&min_nonce);
            std::mem::replace(&mut inner.confirmed, kept)
        } else {
            std::mem::take(&mut inner.confirmed)
        };

        let mut pruned_tx_ids: Vec<u64> = pruned.into_values().map(|tx| tx.id).collect();
        pruned_tx_ids.sort_unstable();
        pruned_tx_ids
    }
}

#[cfg(test)]
impl InMemoryStore {
    pub(crate) fn insert_unstarted(&self) -> Transaction {
        let mut inner = self.inner.write().unwrap();
        inner.next_tx_id += 1;
        let tx = test_tx(inner.next_tx_id, self.address, None, TxState::Unstarted);
        let copy = tx.clone();
        inner.unstarted.push_back(tx);
        copy
    }

    pub(crate) fn insert_unconfirmed(&self, nonce: u64) -> Transaction {
        let mut inner = self.inner.write().unwrap();
        assert!(!inner.unconfirmed.contains_key(&nonce), "nonce {nonce} occupied");
        inner.next_tx_id += 1;
        let tx = test_tx(inner.next_tx_id, self.address, Some(nonce), TxState::Unconfirmed);
        let copy = tx.clone();
        inner.unconfirmed.insert(nonce, tx);
        copy
    }

    pub(crate) fn insert_confirmed(&self, nonce: u64) -> Transaction {
        let mut inner = self.inner.write().unwrap();
        assert!(!inner.confirmed.contains_key(&nonce), "nonce {nonce} occupied");
        inner.next_tx_id += 1;
        let tx = test_tx(inner.next_tx_id, self.address, Some(nonce), TxState::Confirmed);
        let copy = tx.clone();
        inner.confirmed.insert(nonce, tx);
        copy
    }

    pub(crate) fn insert_fatal(&self) -> Transaction {
        let mut inner = self.inner.write().unwrap();
        inner.next_tx_id += 1;
        let tx = test_tx(inner.next_tx_id, self.address, None, TxState::FatalError);
        let copy = tx.clone();
        inner.fatal.push(tx);
        copy
    }

    pub(crate) fn transaction_by_id(&self, tx_id: u64) -> Option<Transaction> {
        let inner = self.inner.read().unwrap();
        inner
            .unstarted
            .iter()
            .chain(inner.unconfirmed.values())
            .chain(inner.confirmed.values())
            .chain(inner.fatal.iter())
            .find(|tx| tx.id == tx_id)
            .cloned()
    }

    pub(crate) fn confirmed_len(&self) -> usize {
        self.inner.read().unwrap().confirmed.len()
    }

    pub(crate) fn unconfirmed_len(&self) -> usize {
        self.inner.read().unwrap().unconfirmed.len()
    }

    pub(crate) fn fatal_len(&self) -> usize {
        self.inner.read().unwrap().fatal.len()
    }

    pub(crate) fn prune_confirmed_for_test(&self) -> Vec<u64> {
        let mut inner = self.inner.write().unwrap();
        Self::prune_confirmed_transactions(&mut inner, self.prune_subset)
    }
}

#[cfg(test)]
fn test_tx(id: u64, from: Address, nonce: Option<u64>, state: TxState) -> Transaction {
    Transaction {
        id,
        idempotency_key: None,
        chain_id: 1337,
        nonce,
        from,
        to: Address::with_last_byte(0xbb),
        value: U256::ZERO,
        data: Bytes::new(),
        gas_limit: 21_000,
        created_at: SystemTime::now(),
        initial_broadcast_at: None,
        last_broadcast_at: None,
        state,
        is_purgeable: false,
        attempts: Vec::new(),
        attempt_count: 0,
        pipeline: None,
        meta: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PipelineCorrelation;

    const MAX_QUEUED: usize = 250;
    const PRUNE_SUBSET: usize = 3;

    fn new_store() -> InMemoryStore {
        InMemoryStore::new(Address::with_last_byte(0xaa), 1337, MAX_QUEUED, PRUNE_SUBSET)
    }

    fn test_attempt(tx_id: u64, hash: B256) -> Attempt {
        Attempt {
            id: 0,
            tx_id,
            hash,
            fee: Default::default(),
            gas_limit: 21_000,
            tx_type: 2,
            signed_payload: Bytes::new(),
            created_at: SystemTime::now(),
            broadcast_at: None,
        }
    }

    fn test_request() -> TransactionRequest {
        TransactionRequest {
            idempotency_key: None,
            chain_id: 1337,
            from: Address::with_last_byte(0xaa),
            to: Address::with_last_byte(0xbb),
            value: U256::ZERO,
            data: Bytes::new(),
            gas_limit: 21_000,
            pipeline: None,
            meta: None,
        }
    }

    #[test]
    fn abandons_unstarted_and_unconfirmed_transactions() {
        let store = new_store();
        let tx1 = store.insert_unstarted();
        let tx2 = store.insert_unstarted();
        let tx3 = store.insert_unconfirmed(3);
        let tx4 = store.insert_unconfirmed(4);

        store.abandon_pending_transactions();

        for id in [tx1.id, tx2.id, tx3.id, tx4.id] {
            let tx = store.transaction_by_id(id).unwrap();
            assert_eq!(tx.state, TxState::FatalError);
        }
        assert_eq!(store.count_unstarted_transactions(), 0);
        assert_eq!(store.unconfirmed_len(), 0);
    }

    #[test]
    fn abandon_skips_confirmed_and_fatal_transactions() {
        let store = new_store();
        store.insert_fatal();
        store.insert_fatal();
        let tx3 = store.insert_confirmed(3);
        let tx4 = store.insert_confirmed(4);

        store.abandon_pending_transactions();

        assert_eq!(store.transaction_by_id(tx3.id).unwrap().state, TxState::Confirmed);
        assert_eq!(store.transaction_by_id(tx4.id).unwrap().state, TxState::Confirmed);
        assert_eq!(store.fatal_len(), 2);
    }

    #[test]
    fn append_attempt_fails_without_unconfirmed_transaction_at_nonce() {
        let store = new_store();
        store.insert_unconfirmed(0);

        let attempt = test_attempt(1, B256::with_last_byte(1));
        let err = store.append_attempt_to_transaction(1, attempt).unwrap_err();
        assert!(matches!(err, StoreError::UnconfirmedTxNotFound { nonce: 1 }));
    }

    #[test]
    fn append_attempt_fails_on_tx_id_mismatch_even_when_nonce_exists() {
        let store = new_store();
        store.insert_unconfirmed(0);

        let attempt = test_attempt(2, B256::with_last_byte(1));
        let err = store.append_attempt_to_transaction(0, attempt).unwrap_err();
        assert!(matches!(err, StoreError::AttemptTxIdMismatch { .. }));
    }

    #[test]
    fn append_attempt_assigns_sequence_number_and_timestamps() {
        let store = new_store();
        let tx = store.insert_unconfirmed(0);

        store
            .append_attempt_to_transaction(0, test_attempt(tx.id, B256::with_last_byte(1)))
            .unwrap();
        store
            .append_attempt_to_transaction(0, test_attempt(tx.id, B256::with_last_byte(2)))
            .unwrap();

        let stored = store.transaction_by_id(tx.id).unwrap();
        assert_eq!(stored.attempts.len(), 2);
        assert_eq!(stored.attempts[0].id, 0);
        assert_eq!(stored.attempts[1].id, 1);
        assert_eq!(stored.attempt_count, 2);
    }

    #[test]
    fn counts_unstarted_transactions() {
        let store = new_store();
        assert_eq!(store.count_unstarted_transactions(), 0);
        store.insert_unstarted();
        assert_eq!(store.count_unstarted_transactions(), 1);
    }

    #[test]
    fn create_empty_unconfirmed_fails_on_occupied_nonce() {
        let store = new_store();
        store.insert_unconfirmed(0);
        store.insert_confirmed(1);

        assert!(matches!(
            store.create_empty_unconfirmed_transaction(0, 0).unwrap_err(),
            StoreError::NonceOccupied { state: TxState::Unconfirmed, .. }
        ));
        assert!(matches!(
            store.create_empty_unconfirmed_transaction(1, 0).unwrap_err(),
            StoreError::NonceOccupied { state: TxState::Confirmed, .. }
        ));
    }

    #[test]
    fn creates_empty_unconfirmed_transaction() {
        let store = new_store();
        let tx = store.create_empty_unconfirmed_transaction(5, 53_000).unwrap();
        assert_eq!(tx.state, TxState::Unconfirmed);
        assert_eq!(tx.nonce, Some(5));
        assert_eq!(tx.gas_limit, 53_000);
        assert_eq!(store.unconfirmed_len(), 1);
    }

    #[test]
    fn creates_new_transactions_with_monotonic_ids() {
        let store = new_store();
        let before = SystemTime::now();

        let tx1 = store.create_transaction(test_request());
        assert_eq!(tx1.id, 1);
        assert!(tx1.created_at >= before);

        let tx2 = store.create_transaction(test_request());
        assert_eq!(tx2.id, 2);

        assert_eq!(store.count_unstarted_transactions(), 2);
    }

    #[test]
    fn carries_pipeline_correlation_through_creation() {
        let store = new_store();
        let correlation = PipelineCorrelation {
            task_run_id: Some(uuid::Uuid::new_v4()),
            min_confirmations: Some(3),
            signal_callback: true,
        };
        let mut request = test_request();
        request.pipeline = Some(correlation.clone());
        request.meta = Some(serde_json::json!({"job": 7}));

        let tx = store.create_transaction(request);
        assert_eq!(tx.pipeline, Some(correlation.clone()));

        // Correlation survives nonce assignment untouched.
        let tx = store.update_unstarted_transaction_with_nonce(0).unwrap().unwrap();
        assert_eq!(tx.pipeline, Some(correlation));
        assert_eq!(tx.meta, Some(serde_json::json!({"job": 7})));
    }

    #[test]
    fn evicts_oldest_unstarted_transactions_at_capacity() {
        let store = new_store();
        let overshot = 3;
        for i in 1..=(MAX_QUEUED + overshot) as u64 {
            let tx = store.create_transaction(test_request());
            assert_eq!(tx.id, i);
        }

        // Exactly the most recently created transactions are retained.
        assert_eq!(store.count_unstarted_transactions(), MAX_QUEUED);
        let oldest = store.update_unstarted_transaction_with_nonce(0).unwrap().unwrap();
        assert_eq!(oldest.id, overshot as u64 + 1);
    }

    #[test]
    fn fetches_unconfirmed_transaction_at_nonce_with_count() {
        let store = new_store();

        let (tx, count) = store.fetch_unconfirmed_transaction_at_nonce_with_count(0);
        assert!(tx.is_none());
        assert_eq!(count, 0);

        store.insert_unconfirmed(0);
        store.insert_unconfirmed(7);
        let (tx, count) = store.fetch_unconfirmed_transaction_at_nonce_with_count(0);
        assert_eq!(tx.unwrap().nonce, Some(0));
        assert_eq!(count, 2);

        // Count is reported even when the nonce lookup misses.
        let (tx, count) = store.fetch_unconfirmed_transaction_at_nonce_with_count(3);
        assert!(tx.is_none());
        assert_eq!(count, 2);
    }

    #[test]
    fn mark_confirmed_is_a_no_op_without_transactions() {
        let store = new_store();
        let (confirmed, unconfirmed) = store.mark_transactions_confirmed(100);
        assert!(confirmed.is_empty());
        assert!(unconfirmed.is_empty());
    }

    #[test]
    fn confirms_transactions_with_nonce_below_latest() {
        let store = new_store();
        let tx1 = store.insert_unconfirmed(0);
        let tx2 = store.insert_unconfirmed(1);

        let (confirmed, unconfirmed) = store.mark_transactions_confirmed(1);
        assert_eq!(confirmed, vec![tx1.id]);
        assert!(unconfirmed.is_empty());
        assert_eq!(store.transaction_by_id(tx1.id).unwrap().state, TxState::Confirmed);
        assert_eq!(store.transaction_by_id(tx2.id).unwrap().state, TxState::Unconfirmed);
    }

    #[test]
    fn unconfirms_transactions_with_nonce_at_or_above_latest() {
        let store = new_store();
        let tx1 = store.insert_confirmed(0);
        let tx2 = store.insert_confirmed(1);

        let (confirmed, unconfirmed) = store.mark_transactions_confirmed(1);
        assert!(confirmed.is_empty());
        assert_eq!(unconfirmed, vec![tx2.id]);
        assert_eq!(store.transaction_by_id(tx1.id).unwrap().state, TxState::Confirmed);
        assert_eq!(store.transaction_by_id(tx2.id).unwrap().state, TxState::Unconfirmed);
    }

    #[test]
    fn mark_confirmed_is_idempotent() {
        let store = new_store();
        store.insert_unconfirmed(0);
        store.insert_unconfirmed(1);

        let (confirmed, unconfirmed) = store.mark_transactions_confirmed(2);
        assert_eq!(confirmed.len(), 2);
        assert!(unconfirmed.is_empty());

        // Same threshold, no intervening mutation: empty delta.
        let (confirmed, unconfirmed) = store.mark_transactions_confirmed(2);
        assert!(confirmed.is_empty());
        assert!(unconfirmed.is_empty());
    }

    #[test]
    fn reorg_round_trip_clears_broadcast_time() {
        let store = new_store();
        let tx = store.insert_unconfirmed(0);
        store
            .append_attempt_to_transaction(0, test_attempt(tx.id, B256::with_last_byte(1)))
            .unwrap();
        store
            .update_transaction_broadcast(tx.id, 0, B256::with_last_byte(1))
            .unwrap();

        let (confirmed, _) = store.mark_transactions_confirmed(1);
        assert_eq!(confirmed, vec![tx.id]);

        // Chain reports nonce 0 again: the confirmation was reorged away.
        let (confirmed, unconfirmed) = store.mark_transactions_confirmed(0);
        assert!(confirmed.is_empty());
        assert_eq!(unconfirmed, vec![tx.id]);

        let reorged = store.transaction_by_id(tx.id).unwrap();
        assert_eq!(reorged.state, TxState::Unconfirmed);
        assert!(reorged.last_broadcast_at.is_none());
        assert!(reorged.initial_broadcast_at.is_none());
    }

    #[test]
    fn same_nonce_never_in_both_partitions() {
        let store = new_store();
        for nonce in 0..10 {
            store.insert_unconfirmed(nonce);
        }
        store.mark_transactions_confirmed(5);
        store.mark_transactions_confirmed(3);
        store.mark_transactions_confirmed(8);

        let inner = store.inner.read().unwrap();
        for nonce in inner.unconfirmed.keys() {
            assert!(!inner.confirmed.contains_key(nonce));
        }
        assert_eq!(inner.unconfirmed.len() + inner.confirmed.len(), 10);
    }

    #[test]
    fn prunes_confirmed_transactions_at_capacity() {
        let store = new_store();
        for nonce in 0..MAX_QUEUED as u64 {
            store.insert_confirmed(nonce);
        }
        assert_eq!(store.confirmed_len(), MAX_QUEUED);

        store.mark_transactions_confirmed(MAX_QUEUED as u64);
        assert_eq!(store.confirmed_len(), MAX_QUEUED - MAX_QUEUED / PRUNE_SUBSET);
    }

    #[test]
    fn prune_evicts_exactly_the_lowest_nonce_third() {
        let store = new_store();
        for nonce in 0..250u64 {
            store.insert_confirmed(nonce);
        }

        let pruned = store.prune_confirmed_for_test();
        assert_eq!(pruned.len(), 83);
        assert_eq!(store.confirmed_len(), 167);

        // Ids were assigned in nonce order, so the evicted set is 1..=83.
        assert_eq!(pruned.first(), Some(&1));
        assert_eq!(pruned.last(), Some(&83));
        let inner = store.inner.read().unwrap();
        assert_eq!(inner.confirmed.keys().next(), Some(&83));
    }

    #[test]
    fn prune_subset_of_one_evicts_the_whole_partition() {
        // A fraction denominator at the extremes must degenerate cleanly
        // instead of panicking inside the lock.
        for prune_subset in [0, 1] {
            let store = InMemoryStore::new(Address::with_last_byte(0xaa), 1337, 3, prune_subset);
            for nonce in 0..3u64 {
                store.insert_unconfirmed(nonce);
            }

            let (confirmed, _) = store.mark_transactions_confirmed(3);
            assert_eq!(confirmed.len(), 3);
            assert_eq!(store.confirmed_len(), 0);
            // The store stays usable afterwards.
            store.insert_unconfirmed(3);
            assert_eq!(store.unconfirmed_len(), 1);
        }
    }

    #[test]
    fn marks_unconfirmed_transaction_purgeable() {
        let store = new_store();
        assert!(matches!(
            store.mark_unconfirmed_transaction_purgeable(0).unwrap_err(),
            StoreError::UnconfirmedTxNotFound { nonce: 0 }
        ));

        let tx = store.insert_unconfirmed(0);
        store.mark_unconfirmed_transaction_purgeable(0).unwrap();
        assert!(store.transaction_by_id(tx.id).unwrap().is_purgeable);
    }

    #[test]
    fn update_broadcast_fails_without_unconfirmed_transaction() {
        let store = new_store();
        let err = store
            .update_transaction_broadcast(0, 0, B256::with_last_byte(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnconfirmedTxNotFound { nonce: 0 }));
    }

    #[test]
    fn update_broadcast_fails_without_matching_attempt() {
        let store = new_store();
        let tx = store.insert_unconfirmed(0);

        let err = store
            .update_transaction_broadcast(tx.id, 0, B256::with_last_byte(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::AttemptNotFound { .. }));

        // Attempt with a different hash still misses.
        store
            .append_attempt_to_transaction(0, test_attempt(tx.id, B256::with_last_byte(2)))
            .unwrap();
        let err = store
            .update_transaction_broadcast(tx.id, 0, B256::with_last_byte(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::AttemptNotFound { .. }));
    }

    #[test]
    fn update_broadcast_stamps_transaction_and_attempt() {
        let store = new_store();
        let tx = store.insert_unconfirmed(0);
        let hash = B256::with_last_byte(1);
        store.append_attempt_to_transaction(0, test_attempt(tx.id, hash)).unwrap();

        store.update_transaction_broadcast(tx.id, 0, hash).unwrap();

        let stored = store.transaction_by_id(tx.id).unwrap();
        let tx_broadcast_at = stored.last_broadcast_at.unwrap();
        assert_eq!(stored.initial_broadcast_at, Some(tx_broadcast_at));
        assert_eq!(stored.attempts[0].broadcast_at, Some(tx_broadcast_at));
    }

    #[test]
    fn assign_nonce_is_a_no_op_on_empty_queue() {
        let store = new_store();
        assert!(store.update_unstarted_transaction_with_nonce(0).unwrap().is_none());
    }

    #[test]
    fn assign_nonce_fails_on_occupied_nonce() {
        let store = new_store();
        store.insert_unstarted();
        store.insert_unconfirmed(0);

        let err = store.update_unstarted_transaction_with_nonce(0).unwrap_err();
        assert!(matches!(err, StoreError::NonceOccupied { .. }));
    }

    #[test]
    fn assigns_nonce_to_oldest_unstarted_transaction() {
        let store = new_store();
        let tx = store.insert_unstarted();

        let updated = store.update_unstarted_transaction_with_nonce(4).unwrap().unwrap();
        assert_eq!(updated.id, tx.id);
        assert_eq!(updated.nonce, Some(4));
        assert_eq!(updated.state, TxState::Unconfirmed);
        assert_eq!(store.count_unstarted_transactions(), 0);
        assert_eq!(store.unconfirmed_len(), 1);
    }

    #[test]
    fn delete_attempt_fails_without_transaction_or_attempt() {
        let store = new_store();
        let attempt = test_attempt(1, B256::with_last_byte(1));
        assert!(matches!(
            store.delete_attempt_for_unconfirmed_tx(0, &attempt).unwrap_err(),
            StoreError::UnconfirmedTxNotFound { nonce: 0 }
        ));

        store.insert_unconfirmed(0);
        assert!(matches!(
            store.delete_attempt_for_unconfirmed_tx(0, &attempt).unwrap_err(),
            StoreError::AttemptNotFound { .. }
        ));
    }

    #[test]
    fn deletes_attempt_of_unconfirmed_transaction() {
        let store = new_store();
        let tx = store.insert_unconfirmed(0);
        let hash = B256::with_last_byte(1);
        store.append_attempt_to_transaction(0, test_attempt(tx.id, hash)).unwrap();

        let attempt = store.transaction_by_id(tx.id).unwrap().attempts[0].clone();
        store.delete_attempt_for_unconfirmed_tx(0, &attempt).unwrap();

        assert!(store.transaction_by_id(tx.id).unwrap().attempts.is_empty());
    }

    #[test]
    fn finds_first_created_transaction_with_idempotency_key() {
        let store = new_store();
        let mut request = test_request();
        request.idempotency_key = Some("key-1".to_string());
        let first = store.create_transaction(request.clone());
        let _second = store.create_transaction(request);

        let found = store.find_tx_with_idempotency_key("key-1").unwrap();
        assert_eq!(found.id, first.id);

        assert!(store.find_tx_with_idempotency_key("missing").is_none());
    }

    #[test]
    fn idempotency_key_lookup_spans_partitions() {
        let store = new_store();
        let mut request = test_request();
        request.idempotency_key = Some("key-2".to_string());
        let tx = store.create_transaction(request);

        store.update_unstarted_transaction_with_nonce(0).unwrap();
        let found = store.find_tx_with_idempotency_key("key-2").unwrap();
        assert_eq!(found.id, tx.id);
        assert_eq!(found.state, TxState::Unconfirmed);
    }

    #[test]
    fn returned_copies_do_not_alias_stored_state() {
        let store = new_store();
        let tx = store.insert_unconfirmed(0);
        store
            .append_attempt_to_transaction(0, test_attempt(tx.id, B256::with_last_byte(1)))
            .unwrap();

        let mut copy = store.transaction_by_id(tx.id).unwrap();
        copy.attempts.clear();
        copy.state = TxState::FatalError;

        let stored = store.transaction_by_id(tx.id).unwrap();
        assert_eq!(stored.attempts.len(), 1);
        assert_eq!(stored.state, TxState::Unconfirmed);
    }

    #[test]
    fn marks_transaction_fatal_from_pending_partitions() {
        let store = new_store();
        let unstarted = store.insert_unstarted();
        let unconfirmed = store.insert_unconfirmed(0);
        let confirmed = store.insert_confirmed(1);

        store.mark_transaction_fatal(unstarted.id).unwrap();
        store.mark_transaction_fatal(unconfirmed.id).unwrap();
        assert_eq!(store.fatal_len(), 2);

        assert!(matches!(
            store.mark_transaction_fatal(confirmed.id).unwrap_err(),
            StoreError::InvalidFatalTransition { .. }
        ));
        assert!(matches!(
            store.mark_transaction_fatal(999).unwrap_err(),
            StoreError::TransactionNotFound { tx_id: 999 }
        ));
    }
}
