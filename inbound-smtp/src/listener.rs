use std::{io, net::SocketAddr};

use futures_util::future::join_all;
use inbound_common::{Signal, internal};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast::{self, error::RecvError},
};

use crate::{ConnectionGate, connection};

/// Accept loop for the SMTP port.
///
/// Every accepted socket goes through the [`ConnectionGate`]; admitted ones
/// get their own task, refused ones a 421 and a closed socket.
#[derive(Debug, Clone)]
pub struct Listener {
    gate: ConnectionGate,
}

impl Listener {
    #[must_use]
    pub const fn new(gate: ConnectionGate) -> Self {
        Self { gate }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) -> io::Result<()> {
        let listener = TcpListener::bind(self.gate.context().config().listen).await?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound socket.
    ///
    /// On shutdown no new connections are accepted and open sessions are
    /// awaited; each of them is told to close with a 421.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve_on(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> io::Result<()> {
        internal!("Serving SMTP on {}", listener.local_addr()?);

        let mut sessions = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(
                        sig,
                        Ok(Signal::Shutdown | Signal::Finalised) | Err(RecvError::Closed)
                    ) {
                        internal!(level = INFO, "SMTP listener received shutdown signal, finishing sessions ...");
                        join_all(sessions).await;
                        return Ok(());
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            internal!(level = WARN, "Failed to accept connection: {err}");
                            continue;
                        }
                    };
                    tracing::debug!("Connection received from {peer}");

                    sessions.retain(|session: &tokio::task::JoinHandle<()>| !session.is_finished());

                    let gate = self.gate.clone();
                    let signal = shutdown.resubscribe();
                    sessions.push(tokio::spawn(handle(gate, stream, peer, signal)));
                }
            }
        }
    }
}

async fn handle(
    gate: ConnectionGate,
    mut stream: TcpStream,
    peer: SocketAddr,
    shutdown: broadcast::Receiver<Signal>,
) {
    match gate.admit(peer).await {
        Ok(session) => {
            if let Err(err) = connection::Connection::new(stream, session)
                .run(shutdown)
                .await
            {
                internal!(level = ERROR, "Session with {peer} ended: {err}");
            }
        }
        Err(err) => {
            tracing::debug!("Refused {peer}: {err}");
            if let Err(err) = connection::refuse(&mut stream, &gate.context().config().domain).await {
                internal!(level = WARN, "Failed to notify refused peer {peer}: {err}");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use inbound_common::Mailbox;
    use inbound_store::{
        MemoryCounterStore, MemoryJobStore, MemoryMailboxDirectory, MemoryObjectStore,
    };
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::{RateLimitConfig, RateLimiter, SessionContext, SmtpConfig};

    struct Fixture {
        address: SocketAddr,
        jobs: Arc<MemoryJobStore>,
        objects: Arc<MemoryObjectStore>,
        shutdown: broadcast::Sender<Signal>,
        server: tokio::task::JoinHandle<io::Result<()>>,
    }

    async fn start(limits: RateLimitConfig) -> Fixture {
        let jobs = Arc::new(MemoryJobStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let mailboxes: MemoryMailboxDirectory =
            std::iter::once(Mailbox::new("mb-1", "user-1", "bob@mymail.com")).collect();

        let context = Arc::new(SessionContext::new(
            SmtpConfig::default(),
            Arc::new(RateLimiter::new(limits, Arc::new(MemoryCounterStore::new()))),
            Arc::new(mailboxes),
            objects.clone(),
            jobs.clone(),
        ));

        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();
        let (shutdown, receiver) = broadcast::channel(4);
        let listener = Listener::new(ConnectionGate::new(context));
        let server = tokio::spawn(async move { listener.serve_on(socket, receiver).await });

        Fixture {
            address,
            jobs,
            objects,
            shutdown,
            server,
        }
    }

    async fn expect(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>, code: &str) -> String {
        let mut line = String::new();
        loop {
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            // skip continuation lines of multi-line replies
            if line.as_bytes().get(3) != Some(&b'-') {
                break;
            }
        }
        assert!(line.starts_with(code), "expected {code}, got {line:?}");
        line
    }

    #[tokio::test]
    async fn accepts_a_message() {
        let fixture = start(RateLimitConfig::default()).await;
        let (read, mut write) = TcpStream::connect(fixture.address).await.unwrap().into_split();
        let mut read = BufReader::new(read);

        expect(&mut read, "220").await;
        for (command, code) in [
            ("EHLO client.example\r\n", "250"),
            ("MAIL FROM:<alice@example.org>\r\n", "250"),
            ("RCPT TO:<bob@mymail.com>\r\n", "250"),
            ("DATA\r\n", "354"),
        ] {
            write.write_all(command.as_bytes()).await.unwrap();
            expect(&mut read, code).await;
        }

        write
            .write_all(b"Subject: hi\r\nMessage-ID: <m1@example.org>\r\n\r\n..dot\r\n.\r\n")
            .await
            .unwrap();
        let queued = expect(&mut read, "250").await;
        assert!(queued.contains("queued as"));

        write.write_all(b"QUIT\r\n").await.unwrap();
        expect(&mut read, "221").await;

        assert_eq!(fixture.jobs.jobs().len(), 1);
        let path = fixture.objects.paths().pop().unwrap();
        assert!(path.starts_with("user-1/"));
        assert!(fixture.objects.get(&path).unwrap().ends_with(b"\r\n.dot\r\n"));

        fixture.shutdown.send(Signal::Shutdown).unwrap();
        fixture.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_connections_get_421() {
        let fixture = start(RateLimitConfig {
            connection_limit: 1,
            ..RateLimitConfig::default()
        })
        .await;

        let first = TcpStream::connect(fixture.address).await.unwrap();
        let (read, _write) = first.into_split();
        expect(&mut BufReader::new(read), "220").await;

        let second = TcpStream::connect(fixture.address).await.unwrap();
        let (read, _write) = second.into_split();
        expect(&mut BufReader::new(read), "421").await;

        fixture.shutdown.send(Signal::Shutdown).unwrap();
        fixture.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_open_sessions() {
        let fixture = start(RateLimitConfig::default()).await;
        let (read, _write) = TcpStream::connect(fixture.address).await.unwrap().into_split();
        let mut read = BufReader::new(read);
        expect(&mut read, "220").await;

        fixture.shutdown.send(Signal::Shutdown).unwrap();

        expect(&mut read, "421").await;
        fixture.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn finalised_stops_the_listener() {
        let fixture = start(RateLimitConfig::default()).await;

        fixture.shutdown.send(Signal::Finalised).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), fixture.server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn protocol_errors_keep_the_session_open() {
        let fixture = start(RateLimitConfig::default()).await;
        let (read, mut write) = TcpStream::connect(fixture.address).await.unwrap().into_split();
        let mut read = BufReader::new(read);
        expect(&mut read, "220").await;

        for (command, code) in [
            ("VRFY bob\r\n", "500"),
            ("DATA\r\n", "503"),
            ("MAIL FROM:<alice@example.org>\r\n", "250"),
            ("RCPT TO:<bob@elsewhere.com>\r\n", "550"),
            ("RCPT TO:<not-an-address>\r\n", "501"),
            ("RSET\r\n", "250"),
            ("NOOP\r\n", "250"),
            ("QUIT\r\n", "221"),
        ] {
            write.write_all(command.as_bytes()).await.unwrap();
            expect(&mut read, code).await;
        }

        assert!(fixture.jobs.jobs().is_empty());
        fixture.shutdown.send(Signal::Shutdown).unwrap();
        fixture.server.await.unwrap().unwrap();
    }
}
