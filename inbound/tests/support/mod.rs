//! Test support utilities for end-to-end testing
//!
//! Starts the listener and the worker over in-process stores and talks to
//! them with a plain-text SMTP client.

pub mod client;
pub mod harness;

pub use client::{Reply, SmtpClient};
pub use harness::TestHarness;
