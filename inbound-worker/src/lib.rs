pub mod config;
pub mod error;
pub mod process;
pub mod processor;

pub use config::WorkerConfig;
pub use error::WorkerError;
pub use processor::{BatchReport, JobProcessor};
