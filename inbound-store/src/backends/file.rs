//! Filesystem implementations of the durable collaborators.
//!
//! Every write lands in a temporary file under `.tmp/` first and is renamed
//! into place once complete, so readers never observe a partial record. A
//! crash leaves at most an orphaned temporary file, which is removed the next
//! time the store is opened.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use chrono::Utc;
use inbound_common::{ContentId, Email, EmailMetadata, JobId, JobStatus, QueueJob, internal};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    fs,
    io::{AsyncRead, AsyncWriteExt},
    sync::Mutex,
};

use crate::{EmailStore, InsertOutcome, JobStore, ObjectStore, StoreError};

const TEMP_DIR: &str = ".tmp";

/// Create `root` and clear temporaries left behind by an earlier process
async fn prepare(root: &Path) -> crate::Result<()> {
    if root.components().any(|c| c == Component::ParentDir) {
        return Err(StoreError::Rejected(format!(
            "Store path cannot contain '..' components: {}",
            root.display()
        )));
    }

    let temp = root.join(TEMP_DIR);
    if fs::try_exists(&temp).await? {
        let mut entries = fs::read_dir(&temp).await?;
        let mut cleaned = 0;
        while let Some(entry) = entries.next_entry().await? {
            fs::remove_file(entry.path()).await?;
            cleaned += 1;
        }
        if cleaned > 0 {
            internal!(
                level = INFO,
                "Removed {cleaned} incomplete write(s) from {}",
                root.display()
            );
        }
    }

    fs::create_dir_all(&temp).await?;
    Ok(())
}

fn temp_path(root: &Path) -> PathBuf {
    root.join(TEMP_DIR).join(ContentId::generate().to_string())
}

async fn discard(temp: &Path) {
    match fs::remove_file(temp).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            tracing::warn!(path = %temp.display(), %err, "Failed to remove temporary file");
        }
        _ => {}
    }
}

/// Move a finished temporary file to `target`, creating its directory
async fn commit(temp: &Path, target: &Path) -> crate::Result<()> {
    let moved = async {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(temp, target).await
    }
    .await;

    if let Err(err) = moved {
        discard(temp).await;
        return Err(err.into());
    }

    Ok(())
}

async fn write_json<T: Serialize + Sync>(root: &Path, target: &Path, value: &T) -> crate::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let temp = temp_path(root);

    if let Err(err) = fs::write(&temp, &bytes).await {
        discard(&temp).await;
        return Err(err.into());
    }

    commit(&temp, target).await
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> crate::Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// `relative` below `root`; only plain, non-hidden components are accepted
fn object_path(root: &Path, relative: &str) -> crate::Result<PathBuf> {
    let path = Path::new(relative);
    let plain = path.components().all(|component| {
        matches!(component, Component::Normal(part) if !part.to_string_lossy().starts_with('.'))
    });

    if relative.is_empty() || !plain {
        return Err(StoreError::Rejected(format!("Invalid object path {relative:?}")));
    }

    Ok(root.join(path))
}

/// A record id usable as a single file name
fn file_name(id: &str) -> crate::Result<&str> {
    if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
        return Err(StoreError::Rejected(format!("Invalid record id {id:?}")));
    }

    Ok(id)
}

/// Message bodies as files below a root directory.
///
/// A put streams into a temporary file and renames it to the object path only
/// after the body ended cleanly, so a failing stream commits nothing.
#[derive(Debug, Clone)]
pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    /// Open (creating if needed) the store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> crate::Result<Self> {
        let root = root.into();
        prepare(&root).await?;
        internal!("Storing message bodies under {}", root.display());

        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Contents of a committed object
    pub async fn read(&self, path: &str) -> crate::Result<Vec<u8>> {
        let file = object_path(&self.root, path)?;
        match fs::read(&file).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("object {path}")))
            }
            Err(err) => Err(err.into()),
        }
    }
}

async fn stream_to(temp: &Path, body: &mut (dyn AsyncRead + Send + Unpin)) -> io::Result<u64> {
    let mut file = fs::File::create(temp).await?;
    let written = tokio::io::copy(body, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn put(
        &self,
        path: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        length: Option<u64>,
    ) -> crate::Result<()> {
        let target = object_path(&self.root, path)?;
        let temp = temp_path(&self.root);

        let written = match stream_to(&temp, body).await {
            Ok(written) => written,
            Err(err) => {
                discard(&temp).await;
                return Err(err.into());
            }
        };

        if let Some(expected) = length.filter(|&expected| expected != written) {
            discard(&temp).await;
            return Err(StoreError::Rejected(format!(
                "Object {path} declared {expected} bytes but streamed {written}"
            )));
        }

        commit(&temp, &target).await?;
        tracing::debug!(path, size = written, "Stored object");

        Ok(())
    }
}

/// Job table with one JSON document per job.
///
/// Pending jobs live in `pending/`. A job reaching a terminal status moves to
/// `completed/` or `failed/`, so polling only scans outstanding work. Writes
/// are serialised within the process; the table is not meant to be shared by
/// several processes.
#[derive(Debug)]
pub struct FileJobStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileJobStore {
    const STATUSES: [JobStatus; 3] = [JobStatus::Pending, JobStatus::Completed, JobStatus::Failed];

    /// Open (creating if needed) the job table rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> crate::Result<Self> {
        let root = root.into();
        prepare(&root).await?;
        for status in Self::STATUSES {
            fs::create_dir_all(root.join(status.to_string())).await?;
        }

        let store = Self {
            root,
            lock: Mutex::new(()),
        };
        let pending = store.pending().await?.len();
        internal!(
            "Job table at {} has {pending} pending job(s)",
            store.root.display()
        );

        Ok(store)
    }

    fn path(&self, status: JobStatus, id: &JobId) -> PathBuf {
        self.root.join(status.to_string()).join(format!("{id}.json"))
    }

    /// A job and the status directory it was found in
    async fn locate(&self, id: &JobId) -> crate::Result<(JobStatus, QueueJob)> {
        for status in Self::STATUSES {
            if let Some(job) = read_json::<QueueJob>(&self.path(status, id)).await? {
                return Ok((status, job));
            }
        }

        Err(StoreError::NotFound(format!("job {id}")))
    }

    /// Every pending job, oldest first
    async fn pending(&self) -> crate::Result<Vec<QueueJob>> {
        let mut entries = fs::read_dir(self.root.join(JobStatus::Pending.to_string())).await?;
        let mut jobs = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|extension| extension != "json") {
                continue;
            }

            match read_json::<QueueJob>(&path).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "Skipping unreadable job");
                }
            }
        }

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Snapshot of every job in the table, oldest first
    pub async fn jobs(&self) -> crate::Result<Vec<QueueJob>> {
        let mut jobs = Vec::new();
        for status in Self::STATUSES {
            let mut entries = fs::read_dir(self.root.join(status.to_string())).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(job) = read_json::<QueueJob>(&entry.path()).await? {
                    jobs.push(job);
                }
            }
        }

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn enqueue(&self, kind: &str, payload: serde_json::Value) -> crate::Result<JobId> {
        let job = QueueJob::new(kind, payload);

        let _guard = self.lock.lock().await;
        write_json(&self.root, &self.path(JobStatus::Pending, &job.id), &job).await?;

        Ok(job.id)
    }

    async fn fetch_pending(&self, limit: usize) -> crate::Result<Vec<QueueJob>> {
        let _guard = self.lock.lock().await;
        let mut jobs = self.pending().await?;
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn set_status(&self, id: &JobId, status: JobStatus) -> crate::Result<()> {
        let _guard = self.lock.lock().await;
        let (current, mut job) = self.locate(id).await?;

        if current.is_terminal() && current != status {
            return Err(StoreError::Rejected(format!("job {id} is already {current}")));
        }

        job.status = status;
        if status.is_terminal() {
            job.processed_at = Some(Utc::now());
        }

        write_json(&self.root, &self.path(status, id), &job).await?;
        if current != status {
            fs::remove_file(self.path(current, id)).await?;
        }

        Ok(())
    }

    async fn increment_attempts(&self, id: &JobId) -> crate::Result<u32> {
        let _guard = self.lock.lock().await;
        let (current, mut job) = self.locate(id).await?;

        job.attempts += 1;
        write_json(&self.root, &self.path(current, id), &job).await?;

        Ok(job.attempts)
    }
}

/// Email and metadata records as JSON files.
///
/// Records are laid out as `emails/{content id}/{mailbox id}.json` and
/// `metadata/{content id}/{mailbox id}.json`.
#[derive(Debug)]
pub struct FileEmailStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileEmailStore {
    /// Open (creating if needed) the email tables rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> crate::Result<Self> {
        let root = root.into();
        prepare(&root).await?;

        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn path(&self, table: &str, id: &str, mailbox_id: &str) -> crate::Result<PathBuf> {
        Ok(self
            .root
            .join(table)
            .join(file_name(id)?)
            .join(format!("{}.json", file_name(mailbox_id)?)))
    }

    pub async fn email(&self, id: &str, mailbox_id: &str) -> crate::Result<Option<Email>> {
        read_json(&self.path("emails", id, mailbox_id)?).await
    }

    pub async fn metadata(
        &self,
        email_id: &str,
        mailbox_id: &str,
    ) -> crate::Result<Option<EmailMetadata>> {
        read_json(&self.path("metadata", email_id, mailbox_id)?).await
    }

    async fn insert<T: Serialize + Sync>(&self, path: &Path, record: &T) -> crate::Result<InsertOutcome> {
        if fs::try_exists(path).await? {
            return Ok(InsertOutcome::AlreadyExists);
        }

        write_json(&self.root, path, record).await?;
        Ok(InsertOutcome::Inserted)
    }
}

#[async_trait]
impl EmailStore for FileEmailStore {
    async fn insert_email(&self, email: &Email) -> crate::Result<InsertOutcome> {
        let path = self.path("emails", &email.id, &email.mailbox_id)?;

        let _guard = self.lock.lock().await;
        self.insert(&path, email).await
    }

    async fn insert_metadata(&self, metadata: &EmailMetadata) -> crate::Result<InsertOutcome> {
        let email = self.path("emails", &metadata.email_id, &metadata.mailbox_id)?;
        let path = self.path("metadata", &metadata.email_id, &metadata.mailbox_id)?;

        let _guard = self.lock.lock().await;
        if !fs::try_exists(&email).await? {
            return Err(StoreError::NotFound(format!(
                "email {} in {}",
                metadata.email_id, metadata.mailbox_id
            )));
        }

        self.insert(&path, metadata).await
    }
}
