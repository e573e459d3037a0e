//! Error types for the inbound-smtp crate.
//!
//! Session errors carry the reply code the wire adapter sends back, so the
//! mapping from failure to SMTP status lives in one place.

use std::{io, net::IpAddr};

use inbound_common::status::Status;
use inbound_store::StoreError;
use thiserror::Error;

/// The counter store failed; the caller must treat this as a denial.
#[derive(Debug, Error)]
#[error("Rate limit check for {key} failed: {source}")]
pub struct RateLimitError {
    pub key: String,
    #[source]
    pub source: StoreError,
}

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No command arrived within the idle timeout.
    #[error("Connection idle for more than {0} seconds")]
    Timeout(u64),
}

/// A connection refused before any session exists.
#[derive(Debug, Error)]
pub enum GateError {
    /// Too many connections from this address in the current window.
    #[error("Connection rate limit exceeded for {0}")]
    RateLimited(IpAddr),

    /// The limiter could not decide; refuse rather than admit unmetered.
    #[error(transparent)]
    LimiterUnavailable(#[from] RateLimitError),
}

/// Failures surfaced to the sender during a mail transaction.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The address is not of the form `local@domain`.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The recipient's domain is not served here.
    #[error("Recipient {address} is not in domain {domain}")]
    DomainMismatch { address: String, domain: String },

    /// The per-transaction recipient cap was reached.
    #[error("Too many recipients, at most {0} allowed")]
    TooManyRecipients(usize),

    /// The command is not valid in the current state.
    #[error("Bad sequence of commands: {0}")]
    BadSequence(&'static str),

    /// The message body exceeded the configured maximum.
    #[error("Message exceeds maximum size of {limit} bytes")]
    MessageTooLarge { limit: u64 },

    /// The header block could not be parsed.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Storing the message body failed; nothing was queued.
    #[error("Failed to store message: {0}")]
    Upload(#[source] StoreError),

    /// No job could be created for any recipient.
    #[error("Failed to queue message: {0}")]
    Enqueue(#[source] StoreError),

    /// Reading the message body from the peer failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Reply code for this failure
    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::InvalidAddress(_) => Status::InvalidParameters,
            Self::DomainMismatch { .. } => Status::Error,
            Self::TooManyRecipients(_) => Status::InsufficientStorage,
            Self::BadSequence(_) => Status::InvalidCommandSequence,
            Self::MessageTooLarge { .. } => Status::ExceededStorage,
            Self::Malformed(_) => Status::TransactionFailed,
            Self::Upload(_) | Self::Enqueue(_) | Self::Io(_) => Status::ActionUnavailable,
        }
    }

    /// Whether the sender should retry later
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.status().is_temporary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        assert_eq!(
            u32::from(
                SessionError::DomainMismatch {
                    address: "a@b.com".to_string(),
                    domain: "mymail.com".to_string()
                }
                .status()
            ),
            550
        );
        assert_eq!(u32::from(SessionError::BadSequence("x").status()), 503);
        assert_eq!(
            u32::from(SessionError::MessageTooLarge { limit: 1 }.status()),
            552
        );
        assert!(SessionError::Upload(StoreError::Unavailable("down".to_string())).is_transient());
        assert!(!SessionError::InvalidAddress("nope".to_string()).is_transient());
    }
}
