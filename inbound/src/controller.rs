use std::{
    path::PathBuf,
    sync::{Arc, LazyLock},
};

use inbound_common::{Mailbox, Signal, internal, logging};
use inbound_smtp::{
    ConnectionGate, Listener, RateLimitConfig, RateLimiter, SessionContext, SmtpConfig,
};
use inbound_store::{
    BroadcastEventChannel, CounterStore, EmailStore, EventChannel, FileEmailStore, FileJobStore,
    FileObjectStore, JobStore, MailboxDirectory, MemoryCounterStore, MemoryEmailStore,
    MemoryJobStore, MemoryMailboxDirectory, MemoryObjectStore, ObjectStore,
};
use inbound_worker::{JobProcessor, WorkerConfig};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::ControllerError;

/// Where rate-limit counters and notifications live
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub enum BackendConfig {
    #[default]
    Memory,
    Redis {
        url: String,
    },
}

/// Where message bodies, jobs and email records live.
///
/// `File` keeps them below `path` in `objects/`, `jobs/` and `emails/`, so
/// queued work survives a restart. The mailbox directory is always seeded
/// from the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub enum StorageConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
}

/// Top-level configuration and process controller
#[derive(Debug, Default, Deserialize)]
pub struct Inbound {
    #[serde(default)]
    smtp: SmtpConfig,
    #[serde(default, alias = "rate_limits")]
    rate_limit: RateLimitConfig,
    #[serde(default)]
    worker: WorkerConfig,
    #[serde(default)]
    backend: BackendConfig,
    #[serde(default)]
    storage: StorageConfig,
    /// Mailboxes known at startup
    #[serde(default, alias = "mailbox")]
    mailboxes: Vec<Mailbox>,
}

/// The collaborators shared by the SMTP side and the worker
#[derive(Debug, Clone)]
pub struct Stores {
    pub mailboxes: Arc<dyn MailboxDirectory>,
    pub objects: Arc<dyn ObjectStore>,
    pub counters: Arc<dyn CounterStore>,
    pub jobs: Arc<dyn JobStore>,
    pub emails: Arc<dyn EmailStore>,
    pub events: Arc<dyn EventChannel>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    // Listener and worker are draining; a second CTRL+C stops waiting for them
    tokio::signal::ctrl_c().await?;
    internal!(level = WARN, "Forced shutdown");

    Ok(())
}

impl Inbound {
    #[must_use]
    pub const fn smtp(&self) -> &SmtpConfig {
        &self.smtp
    }

    #[must_use]
    pub const fn rate_limit(&self) -> &RateLimitConfig {
        &self.rate_limit
    }

    #[must_use]
    pub const fn worker(&self) -> &WorkerConfig {
        &self.worker
    }

    #[must_use]
    pub fn mailboxes(&self) -> &[Mailbox] {
        &self.mailboxes
    }

    /// Create the stores selected by the backend configuration
    ///
    /// # Errors
    ///
    /// If the backend is not compiled in or cannot be reached
    pub async fn stores(&self) -> Result<Stores, ControllerError> {
        let (counters, events): (Arc<dyn CounterStore>, Arc<dyn EventChannel>) =
            match &self.backend {
                BackendConfig::Memory => (
                    Arc::new(MemoryCounterStore::new()),
                    Arc::new(BroadcastEventChannel::default()),
                ),
                #[cfg(feature = "redis")]
                BackendConfig::Redis { url } => {
                    internal!("Connecting to redis at {url}");
                    (
                        Arc::new(inbound_store::RedisCounterStore::connect(url).await?),
                        Arc::new(inbound_store::RedisEventChannel::connect(url).await?),
                    )
                }
                #[cfg(not(feature = "redis"))]
                BackendConfig::Redis { .. } => {
                    return Err(ControllerError::BackendUnavailable("redis"));
                }
            };

        let (objects, jobs, emails): (
            Arc<dyn ObjectStore>,
            Arc<dyn JobStore>,
            Arc<dyn EmailStore>,
        ) = match &self.storage {
            StorageConfig::Memory => (
                Arc::new(MemoryObjectStore::new()),
                Arc::new(MemoryJobStore::new()),
                Arc::new(MemoryEmailStore::new()),
            ),
            StorageConfig::File { path } => {
                internal!("Persisting messages under {}", path.display());
                (
                    Arc::new(FileObjectStore::open(path.join("objects")).await?),
                    Arc::new(FileJobStore::open(path.join("jobs")).await?),
                    Arc::new(FileEmailStore::open(path.join("emails")).await?),
                )
            }
        };

        Ok(Stores {
            mailboxes: Arc::new(self.mailboxes.iter().cloned().collect::<MemoryMailboxDirectory>()),
            objects,
            counters,
            jobs,
            emails,
            events,
        })
    }

    /// Build the SMTP listener and the job processor over `stores`
    #[must_use]
    pub fn services(&self, stores: &Stores) -> (Listener, JobProcessor) {
        let limiter = Arc::new(RateLimiter::new(
            self.rate_limit.clone(),
            stores.counters.clone(),
        ));
        let context = Arc::new(SessionContext::new(
            self.smtp.clone(),
            limiter,
            stores.mailboxes.clone(),
            stores.objects.clone(),
            stores.jobs.clone(),
        ));

        let processor = JobProcessor::new(
            self.worker.clone(),
            stores.jobs.clone(),
            stores.emails.clone(),
            stores.events.clone(),
        );

        (Listener::new(ConnectionGate::new(context)), processor)
    }

    /// Run the listener and the worker until shutdown
    ///
    /// # Errors
    ///
    /// This function will return an error if the stores cannot be set up, the
    /// listen address cannot be bound, or signal handling fails.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        if let Err(err) = logging::init() {
            internal!(level = WARN, "Keeping the installed log subscriber: {err}");
        }

        internal!("Controller running");

        let stores = self.stores().await?;
        let (listener, processor) = self.services(&stores);

        internal!(
            "Accepting mail for {} on {} with {} mailbox(es)",
            self.smtp.domain,
            self.smtp.listen,
            self.mailboxes.len()
        );

        let services = async {
            tokio::try_join!(
                async { listener.serve(SHUTDOWN_BROADCAST.subscribe()).await.map_err(anyhow::Error::from) },
                async { processor.serve(SHUTDOWN_BROADCAST.subscribe()).await.map_err(anyhow::Error::from) },
            )
            .map(|_| ())
        };

        let ret = tokio::select! {
            r = services => r,
            r = shutdown() => r,
        };

        internal!("Shutting down...");

        ret
    }
}
