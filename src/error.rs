use thiserror::Error;

use crate::client::{AttemptBuilderError, ClientError};
use crate::store::StoreError;
use crate::stuck_detector::StuckTxDetectorError;

#[derive(Debug, Error)]
pub enum TxmError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    AttemptBuilder(#[from] AttemptBuilderError),

    #[error(transparent)]
    StuckDetector(#[from] StuckTxDetectorError),

    #[error("txm has not been started")]
    NotStarted,

    #[error("txm is already started")]
    AlreadyStarted,

    #[error("runtime error: {message}")]
    Runtime { message: String },
}
