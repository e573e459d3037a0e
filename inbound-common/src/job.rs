//! Durable work units handed from the SMTP session to the worker.
//!
//! The payload travels as a JSON document so that producers and consumers
//! written against the same key set interoperate. The key set for
//! [`ProcessEmailPayload`] is fixed: `email_id`, `mailbox_id`, `message_id`,
//! `from`, `to`, `subject`, `text_body`, `html_body`, `minio_path` (the
//! storage path) and `size`, plus the optional `headers` map.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::JobId;

/// Job type tag for a received message awaiting persistence
pub const PROCESS_EMAIL: &str = "process_email";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs are never picked up again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: JobId,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    /// A fresh pending job with no recorded attempts
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::generate(),
            kind: kind.into(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    /// Decode the payload according to the job's type tag
    pub fn decode(&self) -> Result<JobPayload, PayloadError> {
        JobPayload::decode(&self.kind, &self.payload)
    }
}

/// Payload of a `process_email` job.
///
/// Every field is optional on the wire and falls back to its empty value, so a
/// producer omitting e.g. `to`, or sending it as `null`, still yields a
/// processable job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessEmailPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_id: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub mailbox_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub message_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub from: String,
    #[serde(deserialize_with = "null_as_default")]
    pub to: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub subject: String,
    #[serde(deserialize_with = "null_as_default")]
    pub text_body: String,
    #[serde(deserialize_with = "null_as_default")]
    pub html_body: String,
    #[serde(rename = "minio_path", deserialize_with = "null_as_default")]
    pub storage_path: String,
    #[serde(deserialize_with = "null_as_default")]
    pub size: u64,
    #[serde(
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub headers: BTreeMap<String, String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ProcessEmailPayload {
    pub fn to_value(&self) -> Result<serde_json::Value, PayloadError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// A job payload resolved by its type tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    ProcessEmail(ProcessEmailPayload),
    /// A type tag this build does not know how to handle
    Unknown(String),
}

impl JobPayload {
    pub fn decode(kind: &str, payload: &serde_json::Value) -> Result<Self, PayloadError> {
        match kind {
            PROCESS_EMAIL => {
                if !payload.is_object() {
                    return Err(PayloadError::NotAnObject(kind.to_string()));
                }

                Ok(Self::ProcessEmail(ProcessEmailPayload::deserialize(
                    payload,
                )?))
            }
            other => Ok(Self::Unknown(other.to_string())),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::ProcessEmail(_) => PROCESS_EMAIL,
            Self::Unknown(kind) => kind.as_str(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    /// The payload document is not a JSON object.
    #[error("Payload for {0} job is not an object")]
    NotAnObject(String),

    /// A field is present but has the wrong shape.
    #[error("Malformed job payload: {0}")]
    Malformed(#[from] serde_json::Error),
}
