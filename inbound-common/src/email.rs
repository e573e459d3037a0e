use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted message instance.
///
/// The id is the content id of the uploaded body, so several records (one per
/// recipient mailbox) may share it along with the `storage_path`. A record is
/// identified by its [`Email::key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    pub id: String,
    pub mailbox_id: String,
    pub message_id: String,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
    pub storage_path: String,
    pub size: u64,
    pub received_at: DateTime<Utc>,
}

impl Email {
    /// `(content id, mailbox id)`, unique per stored record
    #[must_use]
    pub fn key(&self) -> (String, String) {
        (self.id.clone(), self.mailbox_id.clone())
    }
}

/// Side record holding the header map and attachment descriptors of an
/// [`Email`], keyed like the email it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMetadata {
    pub id: String,
    pub email_id: String,
    pub mailbox_id: String,
    pub headers: BTreeMap<String, String>,
    pub attachments: Vec<AttachmentDescriptor>,
}

impl EmailMetadata {
    /// Key of the owning [`Email`]
    #[must_use]
    pub fn email_key(&self) -> (String, String) {
        (self.email_id.clone(), self.mailbox_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub storage_path: String,
}
