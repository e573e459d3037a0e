use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A deliverable address owned by a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: String,
    pub user_id: String,
    pub address: String,
    #[serde(default)]
    pub is_alias: bool,
    #[serde(default)]
    pub is_temp: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Mailbox {
    /// A primary (non-alias, permanent) mailbox created now
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            address: address.into(),
            is_alias: false,
            is_temp: false,
            created_at: now,
            updated_at: now,
        }
    }
}
