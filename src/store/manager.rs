use std::collections::HashMap;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;

use crate::store::in_memory::InMemoryStore;
use crate::store::{StoreError, TxStore};
use crate::types::{Attempt, Transaction, TransactionRequest};

/// Multiplexes the [`InMemoryStore`] interface over a fixed set of managed
/// addresses. Registration happens once at setup via [`add`](Self::add);
/// afterwards the registry is read-only and every operation routes by
/// address, failing with [`StoreError::StoreNotFound`] for unmanaged ones.
pub struct InMemoryStoreManager {
    chain_id: u64,
    max_queued_transactions: usize,
    prune_subset: usize,
    stores: HashMap<Address, InMemoryStore>,
}

impl InMemoryStoreManager {
    pub fn new(chain_id: u64, max_queued_transactions: usize, prune_subset: usize) -> Self {
        Self {
            chain_id,
            max_queued_transactions,
            prune_subset,
            stores: HashMap::new(),
        }
    }

    /// Registers one store per address. Fails with the full list of already
    /// registered addresses; registration is a one-time setup operation, not
    /// a runtime scaling path.
    pub fn add(&mut self, addresses: &[Address]) -> Result<(), StoreError> {
        let mut duplicates = Vec::new();
        for &address in addresses {
            if self.stores.contains_key(&address) {
                duplicates.push(address);
                continue;
            }
            self.stores.insert(
                address,
                InMemoryStore::new(
                    address,
                    self.chain_id,
                    self.max_queued_transactions,
                    self.prune_subset,
                ),
            );
        }

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(StoreError::AddressesAlreadyRegistered {
                addresses: duplicates,
            })
        }
    }

    fn store(&self, address: Address) -> Result<&InMemoryStore, StoreError> {
        self.stores
            .get(&address)
            .ok_or(StoreError::StoreNotFound { address })
    }
}

#[async_trait]
impl TxStore for InMemoryStoreManager {
    async fn abandon_pending_transactions(&self, address: Address) -> Result<(), StoreError> {
        self.store(address)?.abandon_pending_transactions();
        Ok(())
    }

    async fn append_attempt_to_transaction(
        &self,
        address: Address,
        nonce: u64,
        attempt: Attempt,
    ) -> Result<(), StoreError> {
        self.store(address)?.append_attempt_to_transaction(nonce, attempt)
    }

    async fn count_unstarted_transactions(&self, address: Address) -> Result<usize, StoreError> {
        Ok(self.store(address)?.count_unstarted_transactions())
    }

    async fn create_empty_unconfirmed_transaction(
        &self,
        address: Address,
        nonce: u64,
        gas_limit: u64,
    ) -> Result<Transaction, StoreError> {
        self.store(address)?.create_empty_unconfirmed_transaction(nonce, gas_limit)
    }

    async fn create_transaction(
        &self,
        request: TransactionRequest,
    ) -> Result<Transaction, StoreError> {
        Ok(self.store(request.from)?.create_transaction(request))
    }

    async fn delete_attempt_for_unconfirmed_tx(
        &self,
        address: Address,
        nonce: u64,
        attempt: &Attempt,
    ) -> Result<(), StoreError> {
        self.store(address)?.delete_attempt_for_unconfirmed_tx(nonce, attempt)
    }

    async fn fetch_unconfirmed_transaction_at_nonce_with_count(
        &self,
        address: Address,
        nonce: u64,
    ) -> Result<(Option<Transaction>, usize), StoreError> {
        Ok(self
            .store(address)?
            .fetch_unconfirmed_transaction_at_nonce_with_count(nonce))
    }

    async fn find_tx_with_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        // The registry is read-mostly; scan every managed store. Ids are
        // store-scoped, so ties across stores break on the sending address
        // to keep the winner independent of map iteration order.
        let mut found: Option<Transaction> = None;
        for store in self.stores.values() {
            if let Some(tx) = store.find_tx_with_idempotency_key(key) {
                let wins = found
                    .as_ref()
                    .map_or(true, |f| (tx.id, tx.from) < (f.id, f.from));
                if wins {
                    found = Some(tx);
                }
            }
        }
        Ok(found)
    }

    async fn mark_transactions_confirmed(
        &self,
        address: Address,
        latest_nonce: u64,
    ) -> Result<(Vec<u64>, Vec<u64>), StoreError> {
        Ok(self.store(address)?.mark_transactions_confirmed(latest_nonce))
    }

    async fn mark_transaction_fatal(
        &self,
        address: Address,
        tx_id: u64,
    ) -> Result<(), StoreError> {
        self.store(address)?.mark_transaction_fatal(tx_id)
    }

    async fn mark_unconfirmed_transaction_purgeable(
        &self,
        address: Address,
        nonce: u64,
    ) -> Result<(), StoreError> {
        self.store(address)?.mark_unconfirmed_transaction_purgeable(nonce)
    }

    async fn update_transaction_broadcast(
        &self,
        address: Address,
        tx_id: u64,
        nonce: u64,
        attempt_hash: B256,
    ) -> Result<(), StoreError> {
        self.store(address)?.update_transaction_broadcast(tx_id, nonce, attempt_hash)
    }

    async fn update_unstarted_transaction_with_nonce(
        &self,
        address: Address,
        nonce: u64,
    ) -> Result<Option<Transaction>, StoreError> {
        self.store(address)?.update_unstarted_transaction_with_nonce(nonce)
    }
}
