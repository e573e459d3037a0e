pub mod backends;
pub mod error;
pub mod r#trait;

pub use backends::{
    BroadcastEventChannel, FileEmailStore, FileJobStore, FileObjectStore, MemoryCounterStore,
    MemoryEmailStore, MemoryJobStore, MemoryMailboxDirectory, MemoryObjectStore, TestObjectStore,
    UnavailableCounterStore,
};
#[cfg(feature = "redis")]
pub use backends::{RedisCounterStore, RedisEventChannel};
pub use error::{Result, StoreError};
pub use r#trait::{
    CounterStore, EmailStore, EventChannel, InsertOutcome, JobStore, MailboxDirectory, ObjectStore,
};
