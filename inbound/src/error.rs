use inbound_store::StoreError;
use thiserror::Error;

/// Errors raised while wiring the pipeline together.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The configured backend needs a cargo feature this build lacks.
    #[error("Backend {0} is not available in this build (enable the `{0}` feature)")]
    BackendUnavailable(&'static str),

    /// A backing store could not be set up.
    #[error("Failed to initialise store: {0}")]
    Store(#[from] StoreError),
}
