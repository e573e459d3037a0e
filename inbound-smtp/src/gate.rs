use std::{net::SocketAddr, sync::Arc};

use inbound_common::internal;

use crate::{GateError, Session, SessionContext};

/// Per-connection entry point: throttles by source address, then hands out a
/// fresh [`Session`].
#[derive(Debug, Clone)]
pub struct ConnectionGate {
    context: Arc<SessionContext>,
}

impl ConnectionGate {
    #[must_use]
    pub const fn new(context: Arc<SessionContext>) -> Self {
        Self { context }
    }

    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Admit a connection from `peer`.
    ///
    /// Only the IP is used for throttling; the port is ignored. A limiter
    /// failure refuses the connection.
    pub async fn admit(&self, peer: SocketAddr) -> Result<Session, GateError> {
        let address = peer.ip();

        match self.context.limiter().allow_connection(address).await {
            Ok(true) => Ok(Session::new(address, self.context.clone())),
            Ok(false) => {
                internal!(level = INFO, "Refusing connection from {address}: rate limited");
                Err(GateError::RateLimited(address))
            }
            Err(err) => {
                internal!(level = WARN, "Refusing connection from {address}: {err}");
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use inbound_store::{
        MemoryCounterStore, MemoryJobStore, MemoryMailboxDirectory, MemoryObjectStore,
        UnavailableCounterStore,
    };

    use super::*;
    use crate::{RateLimitConfig, RateLimiter, SmtpConfig, State};

    fn context(limiter: &Arc<RateLimiter>) -> Arc<SessionContext> {
        Arc::new(SessionContext::new(
            SmtpConfig::default(),
            limiter.clone(),
            Arc::new(MemoryMailboxDirectory::new()),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryJobStore::new()),
        ))
    }

    #[tokio::test]
    async fn sessions_are_bound_to_the_peer_ip() {
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::default(),
            Arc::new(MemoryCounterStore::new()),
        ));
        let gate = ConnectionGate::new(context(&limiter));

        let session = gate.admit("198.51.100.4:40000".parse().unwrap()).await.unwrap();

        assert_eq!(session.peer(), IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4)));
        assert_eq!(session.state(), State::Idle);
    }

    #[tokio::test]
    async fn ports_share_one_budget() {
        let config = RateLimitConfig {
            connection_limit: 2,
            ..RateLimitConfig::default()
        };
        let limiter = Arc::new(RateLimiter::new(config, Arc::new(MemoryCounterStore::new())));
        let gate = ConnectionGate::new(context(&limiter));

        assert!(gate.admit("10.0.0.1:1000".parse().unwrap()).await.is_ok());
        assert!(gate.admit("10.0.0.1:1001".parse().unwrap()).await.is_ok());
        assert!(matches!(
            gate.admit("10.0.0.1:1002".parse().unwrap()).await,
            Err(GateError::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn limiter_outage_refuses() {
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::default(),
            Arc::new(UnavailableCounterStore),
        ));
        let gate = ConnectionGate::new(context(&limiter));

        assert!(matches!(
            gate.admit("10.0.0.1:1000".parse().unwrap()).await,
            Err(GateError::LimiterUnavailable(_))
        ));
    }
}
