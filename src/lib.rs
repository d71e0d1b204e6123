//! EVM transaction lifecycle engine.
//!
//! Accepts transaction intents, sequences them through nonce assignment and
//! broadcast per sending address, reconciles local state against the chain's
//! nonces, and flags transactions that look stuck. Storage is an in-memory,
//! per-address partitioned store behind the [`store::TxStore`] trait so a
//! durable backend can be slotted in without touching the control loop.

pub mod client;
pub mod config;
pub mod error;
pub mod store;
pub mod stuck_detector;
pub mod txm;
pub mod types;

pub use client::{AttemptBuilder, AttemptBuilderError, ChainClient, ClientError};
pub use config::TxmConfig;
pub use error::TxmError;
pub use store::{InMemoryStore, InMemoryStoreManager, StoreError, TxStore};
pub use stuck_detector::{ChainType, StuckTxDetector, StuckTxDetectorError};
pub use txm::{Txm, TxmHandle};
pub use types::{Attempt, FeeParams, PipelineCorrelation, Transaction, TransactionRequest, TxState};
