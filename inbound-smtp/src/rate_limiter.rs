//! Fixed-window rate limiting over a shared counter store
//!
//! Every check increments a counter keyed by scope and identity. The
//! increment that creates the counter (count == 1) also sets its expiry to
//! the window length, so a window starts with the first hit and the key
//! disappears once it elapses.
//!
//! # Windows
//!
//! ```text
//! ratelimit:connection:{ip}                 60s    10 connections
//! ratelimit:email:user:{user}               24h    1000 messages
//! ratelimit:email:hour:{user}:{epoch/3600}  1h     100 messages
//! ```
//!
//! The hourly key is bucketed by clock hour, not a rolling hour.
//!
//! Counter store failures are returned as errors and callers deny.

use std::{net::IpAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use inbound_store::CounterStore;
use serde::Deserialize;

use crate::error::RateLimitError;

const HOUR_SECS: i64 = 3600;

/// Configuration for rate limiting
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    /// Connections allowed per source address per window
    #[serde(default = "default_connection_limit")]
    pub connection_limit: u64,

    /// Connection window length in seconds
    #[serde(default = "default_connection_window")]
    pub connection_window_secs: u64,

    /// Messages accepted per user per daily window
    #[serde(default = "default_daily_limit")]
    pub email_daily_limit: u64,

    /// Daily window length in seconds
    #[serde(default = "default_daily_window")]
    pub email_daily_window_secs: u64,

    /// Messages accepted per user per clock hour
    #[serde(default = "default_hourly_limit")]
    pub email_hourly_limit: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connection_limit: default_connection_limit(),
            connection_window_secs: default_connection_window(),
            email_daily_limit: default_daily_limit(),
            email_daily_window_secs: default_daily_window(),
            email_hourly_limit: default_hourly_limit(),
        }
    }
}

const fn default_connection_limit() -> u64 {
    10
}

const fn default_connection_window() -> u64 {
    60
}

const fn default_daily_limit() -> u64 {
    1000
}

const fn default_daily_window() -> u64 {
    86400
}

const fn default_hourly_limit() -> u64 {
    100
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    counters: Arc<dyn CounterStore>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig, counters: Arc<dyn CounterStore>) -> Self {
        Self { config, counters }
    }

    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count a connection from `address` and decide whether to admit it
    pub async fn allow_connection(&self, address: IpAddr) -> Result<bool, RateLimitError> {
        let key = format!("ratelimit:connection:{address}");
        let count = self
            .hit(&key, Duration::from_secs(self.config.connection_window_secs))
            .await?;

        let allowed = count <= self.config.connection_limit;
        if !allowed {
            tracing::debug!(%address, count, "Connection rate limit exceeded");
        }

        Ok(allowed)
    }

    /// Count a message for `user_id` and decide whether to accept it
    pub async fn allow_email(&self, user_id: &str) -> Result<bool, RateLimitError> {
        self.allow_email_at(user_id, Utc::now()).await
    }

    /// [`RateLimiter::allow_email`] with an explicit clock reading for the
    /// hourly bucket.
    ///
    /// Both counters are incremented before either ceiling is compared.
    pub async fn allow_email_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RateLimitError> {
        let daily_key = format!("ratelimit:email:user:{user_id}");
        let hourly_key = format!(
            "ratelimit:email:hour:{user_id}:{}",
            now.timestamp().div_euclid(HOUR_SECS)
        );

        let daily = self
            .hit(&daily_key, Duration::from_secs(self.config.email_daily_window_secs))
            .await?;
        let hourly = self
            .hit(&hourly_key, Duration::from_secs(HOUR_SECS.unsigned_abs()))
            .await?;

        let allowed =
            daily <= self.config.email_daily_limit && hourly <= self.config.email_hourly_limit;
        if !allowed {
            tracing::debug!(user_id, daily, hourly, "Email rate limit exceeded");
        }

        Ok(allowed)
    }

    async fn hit(&self, key: &str, window: Duration) -> Result<u64, RateLimitError> {
        let wrap = |source| RateLimitError {
            key: key.to_string(),
            source,
        };

        let count = self.counters.increment(key).await.map_err(wrap)?;
        if count == 1 {
            self.counters.expire(key, window).await.map_err(wrap)?;
        }

        Ok(count)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::Ipv4Addr;

    use chrono::TimeZone;
    use inbound_store::{MemoryCounterStore, UnavailableCounterStore};
    use pretty_assertions::assert_eq;

    use super::*;

    fn limiter(counters: &MemoryCounterStore) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default(), Arc::new(counters.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn eleventh_connection_in_a_minute_is_denied() {
        let counters = MemoryCounterStore::new();
        let limiter = limiter(&counters);
        let address = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

        for attempt in 1..=10 {
            assert!(
                limiter.allow_connection(address).await.unwrap(),
                "attempt {attempt} should be allowed"
            );
        }
        assert!(!limiter.allow_connection(address).await.unwrap());

        let other = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 8));
        assert!(limiter.allow_connection(other).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn window_restarts_after_expiry() {
        let counters = MemoryCounterStore::new();
        let limiter = limiter(&counters);
        let address = IpAddr::V4(Ipv4Addr::LOCALHOST);

        for _ in 0..11 {
            limiter.allow_connection(address).await.unwrap();
        }
        assert!(!limiter.allow_connection(address).await.unwrap());
        assert_eq!(
            counters.ttl("ratelimit:connection:127.0.0.1"),
            Some(Duration::from_secs(60))
        );

        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(limiter.allow_connection(address).await.unwrap());
        assert_eq!(counters.get("ratelimit:connection:127.0.0.1"), Some(1));
    }

    #[tokio::test]
    async fn expiry_is_only_set_on_the_first_hit() {
        let counters = MemoryCounterStore::new();
        let limiter = limiter(&counters);
        let address = IpAddr::V4(Ipv4Addr::LOCALHOST);

        limiter.allow_connection(address).await.unwrap();
        let first = counters.ttl("ratelimit:connection:127.0.0.1").unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.allow_connection(address).await.unwrap();
        let second = counters.ttl("ratelimit:connection:127.0.0.1").unwrap();

        assert!(second < first);
    }

    #[tokio::test]
    async fn hourly_ceiling_uses_clock_buckets() {
        let counters = MemoryCounterStore::new();
        let limiter = limiter(&counters);
        let ten_oclock = Utc.with_ymd_and_hms(2026, 10, 19, 10, 59, 0).unwrap();
        let eleven_oclock = Utc.with_ymd_and_hms(2026, 10, 19, 11, 0, 0).unwrap();

        for _ in 0..100 {
            assert!(limiter.allow_email_at("user-1", ten_oclock).await.unwrap());
        }
        assert!(!limiter.allow_email_at("user-1", ten_oclock).await.unwrap());

        // one minute later is a new clock hour
        assert!(limiter.allow_email_at("user-1", eleven_oclock).await.unwrap());

        let bucket = ten_oclock.timestamp() / 3600;
        assert_eq!(
            counters.get(&format!("ratelimit:email:hour:user-1:{bucket}")),
            Some(101)
        );
        assert_eq!(counters.get("ratelimit:email:user:user-1"), Some(102));
    }

    #[tokio::test]
    async fn daily_ceiling_applies_across_hours() {
        let counters = MemoryCounterStore::new();
        let config = RateLimitConfig {
            email_daily_limit: 3,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config, Arc::new(counters.clone()));
        let start = Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap();

        for hour in 0..3 {
            let at = start + chrono::Duration::hours(hour);
            assert!(limiter.allow_email_at("user-2", at).await.unwrap());
        }

        let at = start + chrono::Duration::hours(3);
        assert!(!limiter.allow_email_at("user-2", at).await.unwrap());
        // the hourly counter was still charged
        let bucket = at.timestamp() / 3600;
        assert_eq!(
            counters.get(&format!("ratelimit:email:hour:user-2:{bucket}")),
            Some(1)
        );
    }

    #[tokio::test]
    async fn unavailable_store_fails_closed() {
        let limiter = RateLimiter::new(
            RateLimitConfig::default(),
            Arc::new(UnavailableCounterStore),
        );

        let err = limiter
            .allow_connection(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap_err();
        assert_eq!(err.key, "ratelimit:connection:127.0.0.1");
        assert!(limiter.allow_email("user-1").await.is_err());
    }
}
