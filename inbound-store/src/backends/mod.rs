mod file;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use file::{FileEmailStore, FileJobStore, FileObjectStore};
pub use memory::{
    BroadcastEventChannel, MemoryCounterStore, MemoryEmailStore, MemoryJobStore,
    MemoryMailboxDirectory, MemoryObjectStore,
};
#[cfg(feature = "redis")]
pub use self::redis::{RedisCounterStore, RedisEventChannel};
pub use test::{TestObjectStore, UnavailableCounterStore};
