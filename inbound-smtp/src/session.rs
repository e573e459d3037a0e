//! The mail transaction state machine.
//!
//! ```text
//! Idle --MAIL--> HaveSender --RCPT--> HaveRecipients --DATA--> Terminal
//!   ^                                                              |
//!   +------------------------------ RSET --------------------------+
//! ```
//!
//! The data phase streams the body once: a header window is captured, the
//! recipients are resolved and throttled, and the window plus the remainder
//! of the stream go to the object store in a single upload shared by every
//! surviving recipient. One job is queued per surviving recipient.

use std::{io::Cursor, net::IpAddr, sync::Arc};

use chrono::{Datelike, Utc};
use inbound_common::{
    ContentId, JobId, Mailbox, ProcessEmailPayload, internal, job::PROCESS_EMAIL,
};
use inbound_store::{JobStore, MailboxDirectory, ObjectStore, StoreError};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    RateLimiter, SmtpConfig,
    error::SessionError,
    headers::ParsedHeaders,
    split::{CountingReader, HeaderWindow},
};

/// Shared configuration and collaborators for every session
#[derive(Debug)]
pub struct SessionContext {
    config: SmtpConfig,
    limiter: Arc<RateLimiter>,
    mailboxes: Arc<dyn MailboxDirectory>,
    objects: Arc<dyn ObjectStore>,
    jobs: Arc<dyn JobStore>,
}

impl SessionContext {
    #[must_use]
    pub fn new(
        config: SmtpConfig,
        limiter: Arc<RateLimiter>,
        mailboxes: Arc<dyn MailboxDirectory>,
        objects: Arc<dyn ObjectStore>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            config,
            limiter,
            mailboxes,
            objects,
            jobs,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SmtpConfig {
        &self.config
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    HaveSender,
    HaveRecipients,
    /// The data phase ran; only reset or logout are accepted
    Terminal,
    Closed,
}

/// What a completed data phase produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataOutcome {
    /// No recipient survived resolution and throttling; nothing was stored
    Discarded { message_id: String, size: u64 },
    Queued(QueuedMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub content_id: ContentId,
    pub storage_path: String,
    pub message_id: String,
    pub size: u64,
    pub jobs: Vec<JobId>,
}

/// One mail transaction on one connection.
///
/// A session is driven by a single task and holds no locks.
#[derive(Debug)]
pub struct Session {
    peer: IpAddr,
    context: Arc<SessionContext>,
    state: State,
    from: Option<String>,
    recipients: Vec<String>,
}

impl Session {
    #[must_use]
    pub const fn new(peer: IpAddr, context: Arc<SessionContext>) -> Self {
        Self {
            peer,
            context,
            state: State::Idle,
            from: None,
            recipients: Vec::new(),
        }
    }

    #[must_use]
    pub const fn peer(&self) -> IpAddr {
        self.peer
    }

    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.from.as_deref()
    }

    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Record the envelope sender. The sender's domain is not checked.
    pub fn mail_from(&mut self, from: &str) -> Result<(), SessionError> {
        if self.state != State::Idle {
            return Err(SessionError::BadSequence("sender already specified"));
        }

        self.from = Some(from.to_string());
        self.state = State::HaveSender;
        Ok(())
    }

    /// Accept a recipient in the served domain.
    ///
    /// A rejected recipient leaves the transaction as it was, so the sender
    /// may continue with other recipients.
    pub fn rcpt_to(&mut self, to: &str) -> Result<(), SessionError> {
        if !matches!(self.state, State::HaveSender | State::HaveRecipients) {
            return Err(SessionError::BadSequence("need MAIL before RCPT"));
        }

        let domain = recipient_domain(to)?;
        if domain != self.context.config.domain {
            return Err(SessionError::DomainMismatch {
                address: to.to_string(),
                domain: self.context.config.domain.clone(),
            });
        }

        if self.recipients.len() >= self.context.config.max_recipients {
            return Err(SessionError::TooManyRecipients(
                self.context.config.max_recipients,
            ));
        }

        self.recipients.push(to.to_string());
        self.state = State::HaveRecipients;
        Ok(())
    }

    /// Check that a body may be sent now, before the peer is invited to send it
    pub const fn ready_for_data(&self) -> Result<(), SessionError> {
        match self.state {
            State::HaveRecipients => Ok(()),
            State::Idle | State::HaveSender => Err(SessionError::BadSequence("need RCPT before DATA")),
            State::Terminal | State::Closed => {
                Err(SessionError::BadSequence("transaction already completed"))
            }
        }
    }

    /// Run the data phase over `body`.
    ///
    /// The session is terminal afterwards whatever the result. Bytes of `body`
    /// left unread (when nothing is stored or the message is rejected) are the
    /// caller's to discard.
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.peer))]
    pub async fn data<R>(&mut self, body: R) -> Result<DataOutcome, SessionError>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.ready_for_data()?;
        self.state = State::Terminal;

        let limit = self.context.config.max_message_size;
        let mut body = CountingReader::new(body, limit);

        let window = HeaderWindow::capture(&mut body)
            .await
            .map_err(|err| too_large_or(&body, limit, err))?;
        let parsed = ParsedHeaders::parse(window.as_bytes(), &self.context.config.domain)?;

        // A body longer than the window is charged here even if it later
        // turns out to be oversized.
        let mailboxes = self.surviving_mailboxes().await;
        let Some(primary) = mailboxes.first() else {
            // Nothing to store, but an oversized message is still refused.
            if !window.is_complete() {
                tokio::io::copy(&mut body, &mut tokio::io::sink())
                    .await
                    .map_err(|err| too_large_or(&body, limit, err))?;
            }

            internal!(
                level = INFO,
                "No deliverable recipients for {}, message discarded",
                parsed.message_id
            );
            return Ok(DataOutcome::Discarded {
                message_id: parsed.message_id,
                size: body.count(),
            });
        };

        let content_id = ContentId::generate();
        let storage_path = storage_path(&primary.user_id, content_id);

        let upload = if window.is_complete() {
            let length = window.len() as u64;
            let mut complete = Cursor::new(window.into_bytes());
            self.context
                .objects
                .put(&storage_path, &mut complete, Some(length))
                .await
        } else {
            let mut stream = Cursor::new(window.into_bytes()).chain(&mut body);
            self.context
                .objects
                .put(&storage_path, &mut stream, None)
                .await
        };

        if let Err(err) = upload {
            if body.exceeded() {
                return Err(SessionError::MessageTooLarge { limit });
            }
            internal!(level = ERROR, "Failed to store {storage_path}: {err}");
            return Err(SessionError::Upload(err));
        }

        let size = body.count();
        let jobs = self
            .enqueue(&mailboxes, content_id, &storage_path, size, parsed.clone())
            .await?;

        internal!(
            level = INFO,
            "Queued {} ({size} bytes) as {content_id} for {} recipient(s)",
            parsed.message_id,
            jobs.len()
        );

        Ok(DataOutcome::Queued(QueuedMessage {
            content_id,
            storage_path,
            message_id: parsed.message_id,
            size,
            jobs,
        }))
    }

    /// Forget the sender and recipients; the session can start a new transaction
    pub fn reset(&mut self) {
        if self.state != State::Closed {
            self.state = State::Idle;
        }
        self.from = None;
        self.recipients.clear();
    }

    pub fn logout(&mut self) {
        self.reset();
        self.state = State::Closed;
    }

    /// Resolve recipients to mailboxes and charge each owner's message budget.
    ///
    /// Unknown and throttled recipients are dropped without telling the sender.
    async fn surviving_mailboxes(&self) -> Vec<Mailbox> {
        let mut survivors = Vec::with_capacity(self.recipients.len());

        for recipient in &self.recipients {
            let mailbox = match self.context.mailboxes.find(recipient).await {
                Ok(Some(mailbox)) => mailbox,
                Ok(None) => {
                    tracing::debug!(%recipient, "No such mailbox, dropping recipient");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(%recipient, %err, "Mailbox lookup failed, dropping recipient");
                    continue;
                }
            };

            match self.context.limiter.allow_email(&mailbox.user_id).await {
                Ok(true) => survivors.push(mailbox),
                Ok(false) => {
                    tracing::info!(%recipient, user_id = %mailbox.user_id, "Recipient throttled");
                }
                Err(err) => {
                    tracing::warn!(%recipient, %err, "Rate limiter unavailable, dropping recipient");
                }
            }
        }

        survivors
    }

    async fn enqueue(
        &self,
        mailboxes: &[Mailbox],
        content_id: ContentId,
        storage_path: &str,
        size: u64,
        parsed: ParsedHeaders,
    ) -> Result<Vec<JobId>, SessionError> {
        let template = ProcessEmailPayload {
            email_id: Some(content_id.to_string()),
            mailbox_id: String::new(),
            message_id: parsed.message_id,
            from: parsed.from,
            to: parsed.to,
            subject: parsed.subject,
            text_body: parsed.text_body,
            html_body: parsed.html_body,
            storage_path: storage_path.to_string(),
            size,
            headers: parsed.headers,
        };

        let mut jobs = Vec::with_capacity(mailboxes.len());
        let mut last_error = None;

        for mailbox in mailboxes {
            let payload = ProcessEmailPayload {
                mailbox_id: mailbox.id.clone(),
                ..template.clone()
            };

            let queued = match payload.to_value() {
                Ok(value) => self.context.jobs.enqueue(PROCESS_EMAIL, value).await,
                Err(err) => Err(StoreError::Rejected(err.to_string())),
            };

            match queued {
                Ok(id) => jobs.push(id),
                Err(err) => {
                    tracing::error!(mailbox_id = %mailbox.id, %err, "Failed to queue job");
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if jobs.is_empty() => Err(SessionError::Enqueue(err)),
            _ => Ok(jobs),
        }
    }
}

/// Domain part of a `local@domain` address with exactly one `@`
fn recipient_domain(address: &str) -> Result<&str, SessionError> {
    let mut parts = address.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) if !local.is_empty() && !domain.is_empty() => Ok(domain),
        _ => Err(SessionError::InvalidAddress(address.to_string())),
    }
}

/// `{user_id}/{YYYY}/{MM}/{DD}/{content_id}.eml`, dated in UTC
fn storage_path(user_id: &str, content_id: ContentId) -> String {
    let today = Utc::now();
    format!(
        "{user_id}/{:04}/{:02}/{:02}/{content_id}.eml",
        today.year(),
        today.month(),
        today.day()
    )
}

fn too_large_or<R>(body: &CountingReader<R>, limit: u64, err: std::io::Error) -> SessionError {
    if body.exceeded() {
        SessionError::MessageTooLarge { limit }
    } else {
        SessionError::Io(err)
    }
}
