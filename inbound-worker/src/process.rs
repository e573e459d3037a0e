//! Per-job processing

use chrono::Utc;
use inbound_common::{
    ContentId, Email, EmailMetadata, JobPayload, ProcessEmailPayload, QueueJob,
    tracing::{debug, warn},
};
use inbound_store::InsertOutcome;

use crate::{error::WorkerError, processor::JobProcessor};

/// What a successfully handled job did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// The email (and its metadata) is stored for the job's mailbox;
    /// `inserted` is false when an earlier attempt of the same job stored it
    Persisted { email_id: String, inserted: bool },
    /// No handler exists for the job type
    UnknownType(String),
}

/// Dispatch a job on its type tag
pub async fn process_job(processor: &JobProcessor, job: &QueueJob) -> Result<Handled, WorkerError> {
    match job.decode()? {
        JobPayload::ProcessEmail(payload) => process_email(processor, payload).await,
        JobPayload::Unknown(kind) => {
            warn!(job_id = %job.id, kind = %kind, "Unknown job type, nothing to do");
            Ok(Handled::UnknownType(kind))
        }
    }
}

/// Persist a received email and its metadata, then announce it.
///
/// Records are keyed by content id and mailbox, so every recipient of a
/// shared upload gets its own. Both inserts are idempotent, so a job retried
/// after a partial success completes without duplicating records. The
/// notification is best effort.
pub async fn process_email(
    processor: &JobProcessor,
    payload: ProcessEmailPayload,
) -> Result<Handled, WorkerError> {
    let (email, headers) = into_email(payload);

    let inserted = processor.emails().insert_email(&email).await? == InsertOutcome::Inserted;
    if !inserted {
        debug!(email_id = %email.id, mailbox_id = %email.mailbox_id, "Email already stored");
    }

    let metadata = EmailMetadata {
        id: ulid::Ulid::new().to_string(),
        email_id: email.id.clone(),
        mailbox_id: email.mailbox_id.clone(),
        headers,
        attachments: Vec::new(),
    };
    processor.emails().insert_metadata(&metadata).await?;

    let notification = serde_json::json!({
        "email_id": email.id,
        "mailbox_id": email.mailbox_id,
    });
    let topic = &processor.config().notification_topic;
    if let Err(err) = processor
        .events()
        .publish(topic, &notification.to_string())
        .await
    {
        warn!(email_id = %email.id, topic = %topic, "Failed to publish notification: {err}");
    }

    Ok(Handled::Persisted {
        email_id: email.id,
        inserted,
    })
}

fn into_email(payload: ProcessEmailPayload) -> (Email, std::collections::BTreeMap<String, String>) {
    let id = match payload.email_id {
        Some(id) if !id.is_empty() => id,
        _ => {
            let id = ContentId::generate().to_string();
            warn!(
                email_id = %id,
                storage_path = %payload.storage_path,
                "Job payload has no email id, generated a new one"
            );
            id
        }
    };

    let email = Email {
        id,
        mailbox_id: payload.mailbox_id,
        message_id: payload.message_id,
        from: payload.from,
        to: payload.to,
        cc: Vec::new(),
        bcc: Vec::new(),
        subject: payload.subject,
        text_body: payload.text_body,
        html_body: payload.html_body,
        storage_path: payload.storage_path,
        size: payload.size,
        received_at: Utc::now(),
    };

    (email, payload.headers)
}
