use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::client::{AttemptBuilder, ChainClient};
use crate::config::TxmConfig;
use crate::error::TxmError;
use crate::store::{StoreError, TxStore};
use crate::types::{Transaction, TransactionRequest};

/// Broadcast/backfill control loop.
///
/// Per managed address, one worker drives unstarted transactions through
/// nonce assignment and broadcast (bounded by the in-flight cap) and a second
/// worker periodically reconciles local state against the chain's latest
/// nonce, promoting confirmations, repairing reorgs and pruning. Addresses
/// are independent; within one address every state mutation is serialized by
/// the store's per-address lock.
pub struct Txm<C, A, S> {
    client: Arc<C>,
    attempt_builder: Arc<A>,
    store: Arc<S>,
    config: TxmConfig,
    chain_id: u64,
    addresses: Vec<Address>,
    started: AtomicBool,
    nonces: Mutex<HashMap<Address, u64>>,
    triggers: Mutex<HashMap<Address, mpsc::UnboundedSender<()>>>,
}

/// Handle over the spawned workers, in charge of graceful teardown.
pub struct TxmHandle<C, A, S> {
    txm: Arc<Txm<C, A, S>>,
    shutdown_txs: Vec<oneshot::Sender<()>>,
    join_handles: Vec<tokio::task::JoinHandle<()>>,
}

impl<C, A, S> std::fmt::Debug for TxmHandle<C, A, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxmHandle")
            .field("workers", &self.join_handles.len())
            .finish_non_exhaustive()
    }
}

impl<C, A, S> Txm<C, A, S>
where
    C: ChainClient,
    A: AttemptBuilder,
    S: TxStore,
{
    pub fn new(
        client: Arc<C>,
        attempt_builder: Arc<A>,
        store: Arc<S>,
        chain_id: u64,
        addresses: Vec<Address>,
        config: TxmConfig,
    ) -> Self {
        Self {
            client,
            attempt_builder,
            store,
            config,
            chain_id,
            addresses,
            started: AtomicBool::new(false),
            nonces: Mutex::new(HashMap::new()),
            triggers: Mutex::new(HashMap::new()),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Creates a new transaction, deduplicated by idempotency key: a retried
    /// request returns the first-created transaction instead of queueing a
    /// second one.
    pub async fn create_transaction(
        &self,
        request: TransactionRequest,
    ) -> Result<Transaction, TxmError> {
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.store.find_tx_with_idempotency_key(key).await? {
                tracing::debug!(
                    tx_id = existing.id,
                    idempotency_key = %key,
                    "returning existing transaction for idempotency key"
                );
                return Ok(existing);
            }
        }
        Ok(self.store.create_transaction(request).await?)
    }

    /// Seeds local nonces from the chain's pending nonce and spawns the
    /// broadcast and backfill workers for every managed address. Fails if any
    /// initial pending-nonce query fails, or if already started.
    pub async fn start(self: &Arc<Self>) -> Result<TxmHandle<C, A, S>, TxmError> {
        // Claim the started flag atomically so concurrent callers cannot
        // both spawn worker sets. A failed start releases the claim.
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TxmError::AlreadyStarted);
        }

        for &address in &self.addresses {
            let pending_nonce = match self.client.pending_nonce(address).await {
                Ok(nonce) => nonce,
                Err(error) => {
                    self.started.store(false, Ordering::SeqCst);
                    return Err(error.into());
                }
            };
            self.set_local_nonce(address, pending_nonce);
            tracing::debug!(address = %address, pending_nonce, "seeded local nonce");
        }

        let mut shutdown_txs = Vec::with_capacity(self.addresses.len() * 2);
        let mut join_handles = Vec::with_capacity(self.addresses.len() * 2);
        for &address in &self.addresses {
            let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
            self.triggers
                .lock()
                .expect("txm lock poisoned")
                .insert(address, trigger_tx);

            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            join_handles.push(tokio::spawn(self.clone().broadcast_loop(
                address,
                trigger_rx,
                shutdown_rx,
            )));
            shutdown_txs.push(shutdown_tx);

            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            join_handles.push(tokio::spawn(self.clone().backfill_loop(address, shutdown_rx)));
            shutdown_txs.push(shutdown_tx);
        }

        tracing::info!(
            chain_id = self.chain_id,
            addresses = self.addresses.len(),
            "txm started"
        );
        Ok(TxmHandle {
            txm: self.clone(),
            shutdown_txs,
            join_handles,
        })
    }

    /// Requests an out-of-band broadcast pass for one address, e.g. right
    /// after a transaction was created, without waiting for the next tick.
    pub fn trigger(&self, address: Address) -> Result<(), TxmError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TxmError::NotStarted);
        }
        let triggers = self.triggers.lock().expect("txm lock poisoned");
        let sender = triggers
            .get(&address)
            .ok_or(StoreError::StoreNotFound { address })?;
        // The worker owning the receiver only goes away at shutdown.
        let _ = sender.send(());
        Ok(())
    }

    async fn broadcast_loop(
        self: Arc<Self>,
        address: Address,
        mut trigger_rx: mpsc::UnboundedReceiver<()>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(self.config.block_time);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::debug!(address = %address, "broadcast worker stopping");
                    break;
                }
                _ = interval.tick() => {
                    if self.run_broadcast_pass(address).await {
                        interval.reset_after(self.retry_delay());
                    }
                }
                Some(()) = trigger_rx.recv() => {
                    if self.run_broadcast_pass(address).await {
                        interval.reset_after(self.retry_delay());
                    }
                }
            }
        }
    }

    /// Runs one broadcast pass and reports whether the loop should back off.
    async fn run_broadcast_pass(&self, address: Address) -> bool {
        match self.broadcast_transaction(address).await {
            Ok(backoff) => backoff,
            Err(error) => {
                // Transient by assumption; the next tick retries.
                tracing::error!(address = %address, %error, "broadcast pass failed");
                false
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        self.config.block_time * self.config.retry_block_threshold
    }

    /// One broadcast step for one address. Returns `Ok(true)` when the loop
    /// should back off (in-flight cap reached, or the chain's pending nonce
    /// lags the local one).
    #[tracing::instrument(skip(self), fields(address = %address))]
    async fn broadcast_transaction(&self, address: Address) -> Result<bool, TxmError> {
        let nonce = self.local_nonce(address);
        let (unconfirmed_tx, unconfirmed_count) = self
            .store
            .fetch_unconfirmed_transaction_at_nonce_with_count(address, nonce)
            .await?;

        // Admission control: a full in-flight window pauses nonce assignment
        // entirely instead of queueing more work against the chain.
        if unconfirmed_count >= self.config.max_in_flight_transactions {
            tracing::debug!(
                unconfirmed_count,
                limit = self.config.max_in_flight_transactions,
                "reached transaction limit, pausing broadcast"
            );
            return Ok(true);
        }

        // Past a fraction of the cap, reconcile against the chain's pending
        // nonce to catch drift (e.g. after a restart) before assigning a
        // nonce the chain would reject.
        // A zero divisor degenerates to reconciling from the first in-flight
        // transaction onwards.
        let reconcile_threshold = self
            .config
            .max_in_flight_transactions
            .checked_div(self.config.in_flight_reconcile_divisor)
            .unwrap_or(0);
        if unconfirmed_count > reconcile_threshold {
            let pending_nonce = self.client.pending_nonce(address).await?;
            if pending_nonce < nonce {
                tracing::debug!(
                    local_nonce = nonce,
                    pending_nonce,
                    "chain pending nonce lags local nonce, deferring broadcast"
                );
                return Ok(true);
            }
        }

        // A transaction already holds the local nonce when an earlier pass
        // assigned it but never completed the send. Re-send it before
        // touching the unstarted queue; its nonce is fixed.
        if let Some(stranded) = unconfirmed_tx {
            if stranded.last_broadcast_at.is_none() {
                tracing::debug!(tx_id = stranded.id, nonce, "re-broadcasting stranded transaction");
                self.create_and_send_attempt(&stranded, address).await?;
            }
            self.set_local_nonce(address, nonce + 1);
            return Ok(false);
        }

        let Some(tx) = self
            .store
            .update_unstarted_transaction_with_nonce(address, nonce)
            .await?
        else {
            return Ok(false);
        };

        self.create_and_send_attempt(&tx, address).await?;
        self.set_local_nonce(address, nonce + 1);
        Ok(false)
    }

    /// Builds, records and broadcasts one signed attempt. A failed network
    /// send removes the recorded attempt again so the step leaves no partial
    /// mutation behind and the next pass starts from a clean record.
    async fn create_and_send_attempt(
        &self,
        tx: &Transaction,
        address: Address,
    ) -> Result<(), TxmError> {
        let nonce = tx.nonce.ok_or(StoreError::MissingNonce { tx_id: tx.id })?;

        let attempt = self.attempt_builder.new_attempt(tx).await?;
        self.store
            .append_attempt_to_transaction(address, nonce, attempt.clone())
            .await?;

        if let Err(send_error) = self.client.send_transaction(&attempt.signed_payload).await {
            if let Err(delete_error) = self
                .store
                .delete_attempt_for_unconfirmed_tx(address, nonce, &attempt)
                .await
            {
                tracing::error!(
                    tx_id = tx.id,
                    nonce,
                    %delete_error,
                    "failed to roll back attempt after failed send"
                );
            }
            return Err(send_error.into());
        }

        self.store
            .update_transaction_broadcast(address, tx.id, nonce, attempt.hash)
            .await?;
        tracing::debug!(tx_id = tx.id, nonce, attempt_hash = %attempt.hash, "broadcast transaction");
        Ok(())
    }

    async fn backfill_loop(self: Arc<Self>, address: Address, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.block_time);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::debug!(address = %address, "backfill worker stopping");
                    break;
                }
                _ = interval.tick() => {
                    let started = Instant::now();
                    if let Err(error) = self.backfill_transactions(address).await {
                        // RPC hiccups are retried on the next tick.
                        tracing::error!(address = %address, %error, "backfill pass failed");
                    }
                    tracing::debug!(
                        address = %address,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "backfill time elapsed"
                    );
                }
            }
        }
    }

    /// One backfill step: fetch the chain's authoritative latest nonce and
    /// reconcile local confirmed/unconfirmed state against it.
    #[tracing::instrument(skip(self), fields(address = %address))]
    async fn backfill_transactions(&self, address: Address) -> Result<(), TxmError> {
        let latest_nonce = self.client.latest_nonce(address).await?;
        let (confirmed_ids, unconfirmed_ids) = self
            .store
            .mark_transactions_confirmed(address, latest_nonce)
            .await?;

        if !confirmed_ids.is_empty() || !unconfirmed_ids.is_empty() {
            tracing::info!(
                latest_nonce,
                confirmed = ?confirmed_ids,
                reorged = ?unconfirmed_ids,
                "reconciled transactions against chain nonce"
            );
        }
        Ok(())
    }

    fn local_nonce(&self, address: Address) -> u64 {
        *self
            .nonces
            .lock()
            .expect("txm lock poisoned")
            .entry(address)
            .or_insert(0)
    }

    fn set_local_nonce(&self, address: Address, nonce: u64) {
        self.nonces
            .lock()
            .expect("txm lock poisoned")
            .insert(address, nonce);
    }
}

impl<C, A, S> TxmHandle<C, A, S>
where
    C: ChainClient,
    A: AttemptBuilder,
    S: TxStore,
{
    /// Stops all workers, waits for in-flight passes to unwind, then
    /// force-transitions every pending transaction to fatal so nothing is
    /// left ambiguous across a restart of the in-memory store.
    pub async fn shutdown(self) -> Result<(), TxmError> {
        tracing::info!(addresses = self.txm.addresses.len(), "txm shutting down");

        for shutdown_tx in self.shutdown_txs {
            let _ = shutdown_tx.send(());
        }
        for result in join_all(self.join_handles).await {
            if let Err(join_error) = result {
                return Err(TxmError::Runtime {
                    message: format!("worker panicked during shutdown: {join_error}"),
                });
            }
        }

        for &address in &self.txm.addresses {
            self.txm.store.abandon_pending_transactions(address).await?;
        }
        self.txm.triggers.lock().expect("txm lock poisoned").clear();
        self.txm.started.store(false, Ordering::SeqCst);

        tracing::info!("txm shut down");
        Ok(())
    }
}
