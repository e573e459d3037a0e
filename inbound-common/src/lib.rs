pub mod email;
pub mod id;
pub mod job;
pub mod logging;
pub mod mailbox;
pub mod status;

pub use tracing;

pub use email::{AttachmentDescriptor, Email, EmailMetadata};
pub use id::{ContentId, JobId};
pub use job::{PROCESS_EMAIL, JobPayload, JobStatus, PayloadError, ProcessEmailPayload, QueueJob};
pub use mailbox::Mailbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
