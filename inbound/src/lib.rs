pub mod config;
pub mod controller;
pub mod error;

pub use controller::{BackendConfig, Inbound, SHUTDOWN_BROADCAST, StorageConfig, Stores};
pub use error::ControllerError;
