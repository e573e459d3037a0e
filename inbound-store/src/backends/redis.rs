//! Redis-backed counters and event publishing.
//!
//! Redis provides the atomic `INCR` the rate limiter relies on when several
//! server processes share one set of counters.

use std::time::Duration;

use ::redis::{Client, aio::ConnectionManager};
use async_trait::async_trait;

use crate::{CounterStore, EventChannel};

async fn connect(url: &str) -> crate::Result<ConnectionManager> {
    let client = Client::open(url)?;
    Ok(ConnectionManager::new(client).await?)
}

#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> crate::Result<Self> {
        Ok(Self {
            connection: connect(url).await?,
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> crate::Result<u64> {
        let mut connection = self.connection.clone();
        Ok(::redis::cmd("INCR")
            .arg(key)
            .query_async(&mut connection)
            .await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> crate::Result<()> {
        let mut connection = self.connection.clone();
        let _: i64 = ::redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .query_async(&mut connection)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisEventChannel {
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisEventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEventChannel").finish_non_exhaustive()
    }
}

impl RedisEventChannel {
    pub async fn connect(url: &str) -> crate::Result<Self> {
        Ok(Self {
            connection: connect(url).await?,
        })
    }
}

#[async_trait]
impl EventChannel for RedisEventChannel {
    async fn publish(&self, topic: &str, message: &str) -> crate::Result<()> {
        let mut connection = self.connection.clone();
        let receivers: i64 = ::redis::cmd("PUBLISH")
            .arg(topic)
            .arg(message)
            .query_async(&mut connection)
            .await?;
        tracing::trace!(topic, receivers, "Published event");
        Ok(())
    }
}
