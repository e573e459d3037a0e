use inbound_common::PayloadError;
use inbound_store::StoreError;
use thiserror::Error;

/// Errors raised while processing queued jobs.
///
/// Any of these on a single job counts as a failed attempt; the job is
/// retried on a later tick until the attempt ceiling is reached.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The job payload could not be decoded.
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// A store call failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
