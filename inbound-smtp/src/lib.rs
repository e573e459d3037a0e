pub mod config;
pub mod connection;
pub mod error;
pub mod gate;
pub mod headers;
pub mod listener;
pub mod rate_limiter;
pub mod session;
pub mod split;

pub use config::SmtpConfig;
pub use connection::Connection;
pub use error::{ConnectionError, GateError, RateLimitError, SessionError};
pub use gate::ConnectionGate;
pub use listener::Listener;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use session::{DataOutcome, QueuedMessage, Session, SessionContext, State};
