//! Collaborator interfaces consumed by the SMTP session and the worker.
//!
//! Implementations are shared as `Arc<dyn Trait>` across connections and
//! must therefore be internally synchronised.

use std::time::Duration;

use async_trait::async_trait;
use inbound_common::{Email, EmailMetadata, JobId, JobStatus, Mailbox, QueueJob};
use tokio::io::AsyncRead;

use crate::Result;

/// Result of an idempotent insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

#[async_trait]
pub trait MailboxDirectory: std::fmt::Debug + Send + Sync {
    /// Look up a mailbox by exact address; `None` when there is no such mailbox
    async fn find(&self, address: &str) -> Result<Option<Mailbox>>;
}

#[async_trait]
pub trait ObjectStore: std::fmt::Debug + Send + Sync {
    /// Stream `body` to `path`.
    ///
    /// `length` is `None` when the size is not known up front. If reading
    /// `body` fails the object must not be committed.
    async fn put(
        &self,
        path: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        length: Option<u64>,
    ) -> Result<()>;
}

#[async_trait]
pub trait CounterStore: std::fmt::Debug + Send + Sync {
    /// Atomically increment `key`, creating it at zero first, and return the new count
    async fn increment(&self, key: &str) -> Result<u64>;

    /// Expire `key` after `ttl`
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

#[async_trait]
pub trait EventChannel: std::fmt::Debug + Send + Sync {
    async fn publish(&self, topic: &str, message: &str) -> Result<()>;
}

#[async_trait]
pub trait JobStore: std::fmt::Debug + Send + Sync {
    /// Persist a new pending job
    async fn enqueue(&self, kind: &str, payload: serde_json::Value) -> Result<JobId>;

    /// Up to `limit` pending jobs, oldest first
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<QueueJob>>;

    /// Record a status; terminal statuses also stamp the processed time
    async fn set_status(&self, id: &JobId, status: JobStatus) -> Result<()>;

    /// Increment the attempt counter, returning the new value
    async fn increment_attempts(&self, id: &JobId) -> Result<u32>;
}

#[async_trait]
pub trait EmailStore: std::fmt::Debug + Send + Sync {
    /// Insert an email; an existing `(id, mailbox_id)` record is left untouched
    async fn insert_email(&self, email: &Email) -> Result<InsertOutcome>;

    /// Insert the metadata of an existing email; one record per email key
    async fn insert_metadata(&self, metadata: &EmailMetadata) -> Result<InsertOutcome>;
}
