//! End-to-end test harness
//!
//! Runs the SMTP listener on a random local port and the job processor with a
//! short poll interval, both over in-memory stores the tests can inspect.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use inbound::{Inbound, Stores};
use inbound_common::Signal;
use inbound_store::{
    BroadcastEventChannel, MemoryCounterStore, MemoryEmailStore, MemoryJobStore,
    MemoryMailboxDirectory, MemoryObjectStore,
};
use inbound_worker::WorkerError;
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle, time::timeout};

use super::client::{Reply, SmtpClient};

pub struct TestHarness {
    address: SocketAddr,
    objects: MemoryObjectStore,
    jobs: MemoryJobStore,
    emails: MemoryEmailStore,
    events: BroadcastEventChannel,
    listener_handle: JoinHandle<io::Result<()>>,
    worker_handle: JoinHandle<Result<(), WorkerError>>,
    shutdown_tx: broadcast::Sender<Signal>,
}

impl TestHarness {
    #[must_use]
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::new()
    }

    #[must_use]
    #[allow(dead_code)] // Available for advanced test scenarios
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    #[must_use]
    pub const fn objects(&self) -> &MemoryObjectStore {
        &self.objects
    }

    #[must_use]
    pub const fn jobs(&self) -> &MemoryJobStore {
        &self.jobs
    }

    #[must_use]
    pub const fn emails(&self) -> &MemoryEmailStore {
        &self.emails
    }

    /// Receive notifications published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.events.subscribe()
    }

    pub async fn connect(&self) -> anyhow::Result<(SmtpClient, Reply)> {
        SmtpClient::connect(self.address).await
    }

    /// Submit one message and return the reply to the end of DATA
    ///
    /// # Errors
    ///
    /// If the connection fails or any command before the body is refused
    pub async fn send_email(
        &self,
        from: &str,
        recipients: &[&str],
        message: &str,
    ) -> anyhow::Result<Reply> {
        let (mut client, greeting) = self.connect().await?;
        anyhow::ensure!(greeting.code == 220, "Unexpected greeting {greeting:?}");

        let mut commands = vec!["EHLO test-client".to_string(), format!("MAIL FROM:<{from}>")];
        commands.extend(recipients.iter().map(|to| format!("RCPT TO:<{to}>")));
        commands.push("DATA".to_string());

        for command in commands {
            let reply = client.command(&command).await?;
            anyhow::ensure!(reply.is_positive(), "{command} refused: {reply:?}");
        }

        let reply = client.body(message).await?;
        client.command("QUIT").await?;

        Ok(reply)
    }

    /// Poll until `count` emails are stored
    ///
    /// # Errors
    ///
    /// If the count is not reached within `timeout_duration`
    pub async fn wait_for_emails(&self, count: usize, timeout_duration: Duration) -> anyhow::Result<()> {
        let start = tokio::time::Instant::now();

        while self.emails.email_count() < count {
            if start.elapsed() > timeout_duration {
                anyhow::bail!(
                    "Timeout waiting for {count} emails, {} stored",
                    self.emails.email_count()
                );
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Ok(())
    }

    /// Poll until every job has reached a terminal status
    ///
    /// # Errors
    ///
    /// If some job is still pending after `timeout_duration`
    pub async fn wait_for_jobs(&self, timeout_duration: Duration) -> anyhow::Result<()> {
        let start = tokio::time::Instant::now();

        loop {
            let pending = self
                .jobs
                .jobs()
                .iter()
                .filter(|job| !job.status.is_terminal())
                .count();
            if pending == 0 {
                return Ok(());
            }

            if start.elapsed() > timeout_duration {
                anyhow::bail!("Timeout waiting for jobs, {pending} still pending");
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop the listener and the worker
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(Signal::Shutdown);

        let _ = timeout(Duration::from_secs(5), async {
            let _ = self.listener_handle.await;
            let _ = self.worker_handle.await;
        })
        .await;
    }
}

pub struct TestHarnessBuilder {
    domain: String,
    mailboxes: Vec<(String, String, String)>,
    connection_limit: u64,
    max_message_size: u64,
    poll_interval_ms: u64,
}

impl TestHarnessBuilder {
    fn new() -> Self {
        Self {
            domain: "mymail.com".to_string(),
            mailboxes: Vec::new(),
            connection_limit: 100,
            max_message_size: 10 * 1024 * 1024,
            poll_interval_ms: 50,
        }
    }

    #[must_use]
    pub fn with_mailbox(mut self, id: &str, user_id: &str, address: &str) -> Self {
        self.mailboxes
            .push((id.to_string(), user_id.to_string(), address.to_string()));
        self
    }

    #[must_use]
    pub const fn with_connection_limit(mut self, limit: u64) -> Self {
        self.connection_limit = limit;
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, size: u64) -> Self {
        self.max_message_size = size;
        self
    }

    /// Start the listener and worker
    ///
    /// # Errors
    ///
    /// If the configuration is rejected or no local port can be bound
    pub async fn build(self) -> anyhow::Result<TestHarness> {
        let mailboxes = self
            .mailboxes
            .iter()
            .map(|(id, user_id, address)| {
                format!(r#"(id: "{id}", user_id: "{user_id}", address: "{address}")"#)
            })
            .collect::<Vec<_>>()
            .join(", ");

        let inbound: Inbound = ron::from_str(&format!(
            r#"Inbound(
                smtp: (domain: "{}", max_message_size: {}, command_timeout_secs: 5),
                rate_limit: (connection_limit: {}),
                worker: (poll_interval_ms: {}),
                mailboxes: [{mailboxes}],
            )"#,
            self.domain, self.max_message_size, self.connection_limit, self.poll_interval_ms,
        ))?;

        let objects = MemoryObjectStore::new();
        let jobs = MemoryJobStore::new();
        let emails = MemoryEmailStore::new();
        let events = BroadcastEventChannel::default();

        let stores = Stores {
            mailboxes: Arc::new(
                inbound
                    .mailboxes()
                    .iter()
                    .cloned()
                    .collect::<MemoryMailboxDirectory>(),
            ),
            objects: Arc::new(objects.clone()),
            counters: Arc::new(MemoryCounterStore::new()),
            jobs: Arc::new(jobs.clone()),
            emails: Arc::new(emails.clone()),
            events: Arc::new(events.clone()),
        };

        let (listener, processor) = inbound.services(&stores);

        let socket = TcpListener::bind("127.0.0.1:0").await?;
        let address = socket.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel(16);

        let shutdown_rx = shutdown_tx.subscribe();
        let listener_handle =
            tokio::spawn(async move { listener.serve_on(socket, shutdown_rx).await });

        let shutdown_rx = shutdown_tx.subscribe();
        let worker_handle = tokio::spawn(async move { processor.serve(shutdown_rx).await });

        Ok(TestHarness {
            address,
            objects,
            jobs,
            emails,
            events,
            listener_handle,
            worker_handle,
            shutdown_tx,
        })
    }
}
