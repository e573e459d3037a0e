//! In-process implementations of the storage collaborators.
//!
//! These back the single-process deployment and the test suites. Each type is
//! cheap to clone; clones share the same underlying state.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use inbound_common::{Email, EmailMetadata, JobId, JobStatus, Mailbox, QueueJob};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::broadcast,
    time::Instant,
};

use crate::{
    CounterStore, EmailStore, EventChannel, InsertOutcome, JobStore, MailboxDirectory,
    ObjectStore, StoreError,
};

/// Address to mailbox map
#[derive(Debug, Clone, Default)]
pub struct MemoryMailboxDirectory {
    mailboxes: Arc<DashMap<String, Mailbox>>,
}

impl MemoryMailboxDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mailbox under its address, replacing any previous entry
    pub fn insert(&self, mailbox: Mailbox) {
        self.mailboxes.insert(mailbox.address.clone(), mailbox);
    }
}

impl FromIterator<Mailbox> for MemoryMailboxDirectory {
    fn from_iter<T: IntoIterator<Item = Mailbox>>(iter: T) -> Self {
        let directory = Self::new();
        for mailbox in iter {
            directory.insert(mailbox);
        }
        directory
    }
}

#[async_trait]
impl MailboxDirectory for MemoryMailboxDirectory {
    async fn find(&self, address: &str) -> crate::Result<Option<Mailbox>> {
        Ok(self.mailboxes.get(address).map(|entry| entry.value().clone()))
    }
}

/// Path to object map.
///
/// A put reads the whole stream before committing, so a stream that fails
/// part way leaves nothing behind.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.get(path).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.objects.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        path: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        length: Option<u64>,
    ) -> crate::Result<()> {
        let mut buffer = Vec::new();
        body.read_to_end(&mut buffer).await?;

        if let Some(expected) = length
            && expected != buffer.len() as u64
        {
            return Err(StoreError::Rejected(format!(
                "Object {path} declared {expected} bytes but streamed {}",
                buffer.len()
            )));
        }

        tracing::debug!(path, size = buffer.len(), "Stored object");
        self.objects.insert(path.to_string(), buffer);

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Counters with per-key expiry.
///
/// Expiry is measured on the tokio clock so paused-time tests can advance it.
/// An expired counter is treated as absent: the next increment starts it at 1.
#[derive(Debug, Clone, Default)]
pub struct MemoryCounterStore {
    counters: Arc<DashMap<String, Counter>>,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a live counter
    #[must_use]
    pub fn get(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.counters
            .get(key)
            .filter(|counter| !counter.is_expired(now))
            .map(|counter| counter.count)
    }

    /// Remaining lifetime of a live counter, `None` when it has no expiry
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.counters
            .get(key)
            .filter(|counter| !counter.is_expired(now))
            .and_then(|counter| counter.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> crate::Result<u64> {
        let now = Instant::now();
        let mut counter = self.counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: None,
        });

        if counter.is_expired(now) {
            *counter = Counter {
                count: 0,
                expires_at: None,
            };
        }

        counter.count += 1;
        Ok(counter.count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> crate::Result<()> {
        if let Some(mut counter) = self.counters.get_mut(key) {
            counter.expires_at = Some(Instant::now() + ttl);
        }

        Ok(())
    }
}

/// Job table kept in creation order
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<Vec<QueueJob>>>,
}

impl MemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job as-is, e.g. one produced by another system
    pub fn push(&self, job: QueueJob) -> JobId {
        let id = job.id;
        self.jobs.lock().push(job);
        id
    }

    #[must_use]
    pub fn get(&self, id: &JobId) -> Option<QueueJob> {
        self.jobs.lock().iter().find(|job| job.id == *id).cloned()
    }

    /// Snapshot of every job, oldest first
    #[must_use]
    pub fn jobs(&self) -> Vec<QueueJob> {
        self.jobs.lock().clone()
    }

    fn with_job<T>(&self, id: &JobId, f: impl FnOnce(&mut QueueJob) -> crate::Result<T>) -> crate::Result<T> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .iter_mut()
            .find(|job| job.id == *id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        f(job)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, kind: &str, payload: serde_json::Value) -> crate::Result<JobId> {
        Ok(self.push(QueueJob::new(kind, payload)))
    }

    async fn fetch_pending(&self, limit: usize) -> crate::Result<Vec<QueueJob>> {
        Ok(self
            .jobs
            .lock()
            .iter()
            .filter(|job| job.status == JobStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_status(&self, id: &JobId, status: JobStatus) -> crate::Result<()> {
        self.with_job(id, |job| {
            if job.status.is_terminal() && job.status != status {
                return Err(StoreError::Rejected(format!(
                    "job {id} is already {}",
                    job.status
                )));
            }

            job.status = status;
            if status.is_terminal() {
                job.processed_at = Some(Utc::now());
            }
            Ok(())
        })
    }

    async fn increment_attempts(&self, id: &JobId) -> crate::Result<u32> {
        self.with_job(id, |job| {
            job.attempts += 1;
            Ok(job.attempts)
        })
    }
}

/// Email and metadata tables, both keyed by `(content id, mailbox id)`
#[derive(Debug, Clone, Default)]
pub struct MemoryEmailStore {
    emails: Arc<DashMap<(String, String), Email>>,
    metadata: Arc<DashMap<(String, String), EmailMetadata>>,
}

impl MemoryEmailStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn email(&self, id: &str, mailbox_id: &str) -> Option<Email> {
        self.emails
            .get(&(id.to_string(), mailbox_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Every record sharing the content id `id`, ordered by mailbox
    #[must_use]
    pub fn emails_with_id(&self, id: &str) -> Vec<Email> {
        let mut emails: Vec<_> = self
            .emails
            .iter()
            .filter(|entry| entry.key().0 == id)
            .map(|entry| entry.value().clone())
            .collect();
        emails.sort_by(|a, b| a.mailbox_id.cmp(&b.mailbox_id));
        emails
    }

    #[must_use]
    pub fn metadata(&self, email_id: &str, mailbox_id: &str) -> Option<EmailMetadata> {
        self.metadata
            .get(&(email_id.to_string(), mailbox_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn email_count(&self) -> usize {
        self.emails.len()
    }
}

#[async_trait]
impl EmailStore for MemoryEmailStore {
    async fn insert_email(&self, email: &Email) -> crate::Result<InsertOutcome> {
        Ok(match self.emails.entry(email.key()) {
            Entry::Occupied(_) => InsertOutcome::AlreadyExists,
            Entry::Vacant(slot) => {
                slot.insert(email.clone());
                InsertOutcome::Inserted
            }
        })
    }

    async fn insert_metadata(&self, metadata: &EmailMetadata) -> crate::Result<InsertOutcome> {
        let key = metadata.email_key();
        if !self.emails.contains_key(&key) {
            return Err(StoreError::NotFound(format!(
                "email {} in {}",
                metadata.email_id, metadata.mailbox_id
            )));
        }

        Ok(match self.metadata.entry(key) {
            Entry::Occupied(_) => InsertOutcome::AlreadyExists,
            Entry::Vacant(slot) => {
                slot.insert(metadata.clone());
                InsertOutcome::Inserted
            }
        })
    }
}

/// In-process publish/subscribe over a tokio broadcast channel.
///
/// Publishing with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastEventChannel {
    sender: broadcast::Sender<(String, String)>,
}

impl BroadcastEventChannel {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every `(topic, message)` published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventChannel {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl EventChannel for BroadcastEventChannel {
    async fn publish(&self, topic: &str, message: &str) -> crate::Result<()> {
        let delivered = self
            .sender
            .send((topic.to_string(), message.to_string()))
            .unwrap_or_default();
        tracing::trace!(topic, delivered, "Published event");
        Ok(())
    }
}
