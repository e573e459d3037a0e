//! Line-oriented SMTP dialogue driving a [`Session`].
//!
//! Only the commands needed to receive mail are understood. There is no
//! STARTTLS and no AUTH.

use std::{
    fmt::Display,
    io,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Duration,
};

use inbound_common::{Signal, incoming, internal, outgoing, status::Status};
use tokio::{
    io::{
        AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
        BufStream, ReadBuf,
    },
    sync::broadcast,
};

use crate::{DataOutcome, Session, error::ConnectionError};

/// Longest command line accepted, including the CRLF
const MAX_LINE: usize = 1000;

/// Body lines longer than this are forwarded in pieces
const BODY_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseError {
    Unknown,
    Syntax(&'static str),
}

impl Command {
    fn parse(line: &str) -> Result<Self, ParseError> {
        let (verb, rest) = line
            .split_once(' ')
            .map_or((line, ""), |(verb, rest)| (verb, rest.trim()));

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => Ok(Self::Helo(rest.to_string())),
            "EHLO" => Ok(Self::Ehlo(rest.to_string())),
            "MAIL" => strip_keyword(rest, "FROM:")
                .map(|path| Self::MailFrom(path.to_string()))
                .ok_or(ParseError::Syntax("Syntax: MAIL FROM:<address>")),
            "RCPT" => strip_keyword(rest, "TO:")
                .map(|path| Self::RcptTo(path.to_string()))
                .ok_or(ParseError::Syntax("Syntax: RCPT TO:<address>")),
            "DATA" => Ok(Self::Data),
            "RSET" => Ok(Self::Rset),
            "NOOP" => Ok(Self::Noop),
            "QUIT" => Ok(Self::Quit),
            _ => Err(ParseError::Unknown),
        }
    }
}

/// The address of `FROM:<addr> PARAMS`, without angle brackets
fn strip_keyword<'a>(argument: &'a str, keyword: &str) -> Option<&'a str> {
    let head = argument.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }

    let path = argument[keyword.len()..].trim_start();
    if let Some(bracketed) = path.strip_prefix('<') {
        return bracketed.split_once('>').map(|(address, _)| address);
    }

    path.split_whitespace().next()
}

enum Line {
    Text(String),
    TooLong,
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<Line>> {
    let mut buffer = Vec::with_capacity(128);
    let read = (&mut *reader)
        .take(MAX_LINE as u64)
        .read_until(b'\n', &mut buffer)
        .await?;

    if read == 0 {
        return Ok(None);
    }

    if buffer.last() != Some(&b'\n') {
        if buffer.len() < MAX_LINE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-command",
            ));
        }

        // discard the rest of the oversized line
        loop {
            buffer.clear();
            let read = (&mut *reader)
                .take(MAX_LINE as u64)
                .read_until(b'\n', &mut buffer)
                .await?;
            if read == 0 || buffer.last() == Some(&b'\n') {
                return Ok(Some(Line::TooLong));
            }
        }
    }

    let text = String::from_utf8_lossy(&buffer);
    Ok(Some(Line::Text(text.trim_end_matches(['\r', '\n']).to_string())))
}

/// Write a refusal to a connection that was not admitted
pub async fn refuse<S: AsyncWrite + Unpin>(stream: &mut S, domain: &str) -> io::Result<()> {
    let reply = format!(
        "{} {domain} Service not available, closing transmission channel\r\n",
        Status::Unavailable
    );
    outgoing!("{}", reply.trim_end());
    stream.write_all(reply.as_bytes()).await?;
    stream.flush().await
}

enum Next {
    Line(Result<io::Result<Option<Line>>, tokio::time::error::Elapsed>),
    Shutdown,
}

/// One accepted connection and its session
#[derive(Debug)]
pub struct Connection<S> {
    stream: BufStream<S>,
    session: Session,
    domain: String,
    max_message_size: u64,
    command_timeout: Duration,
    data_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    pub fn new(stream: S, session: Session) -> Self {
        let config = session.context().config().clone();
        Self {
            stream: BufStream::new(stream),
            session,
            domain: config.domain,
            max_message_size: config.max_message_size,
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            data_timeout: Duration::from_secs(config.data_timeout_secs),
        }
    }

    /// Serve commands until QUIT, end of stream, idle timeout or shutdown
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.session.peer()))]
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), ConnectionError> {
        internal!("Connected");
        self.reply(Status::ServiceReady, format!("{} ESMTP ready", self.domain))
            .await?;

        loop {
            let next = tokio::select! {
                line = tokio::time::timeout(self.command_timeout, read_line(&mut self.stream)) => {
                    Next::Line(line)
                }
                _ = shutdown.recv() => Next::Shutdown,
            };

            let line = match next {
                Next::Shutdown => {
                    self.reply(Status::Unavailable, format!("{} shutting down", self.domain))
                        .await?;
                    return Ok(());
                }
                Next::Line(Err(_)) => {
                    self.reply(Status::Unavailable, "Idle timeout, closing connection")
                        .await?;
                    return Err(ConnectionError::Timeout(self.command_timeout.as_secs()));
                }
                Next::Line(Ok(line)) => line?,
            };

            let line = match line {
                None => {
                    internal!("Peer closed the connection");
                    return Ok(());
                }
                Some(Line::TooLong) => {
                    self.reply(Status::SyntaxError, "Line too long").await?;
                    continue;
                }
                Some(Line::Text(line)) => line,
            };

            incoming!("{line}");

            let command = match Command::parse(&line) {
                Ok(command) => command,
                Err(ParseError::Unknown) => {
                    self.reply(Status::SyntaxError, "Command not recognized")
                        .await?;
                    continue;
                }
                Err(ParseError::Syntax(usage)) => {
                    self.reply(Status::InvalidParameters, usage).await?;
                    continue;
                }
            };

            if !self.handle(command).await? {
                return Ok(());
            }
        }
    }

    /// Returns `false` once the connection should close
    async fn handle(&mut self, command: Command) -> Result<bool, ConnectionError> {
        match command {
            Command::Helo(client) => {
                self.session.reset();
                self.reply(Status::Ok, format!("{} Hello {client}", self.domain))
                    .await?;
            }
            Command::Ehlo(client) => {
                self.session.reset();
                let reply = format!(
                    "{ok}-{} Hello {client}\r\n{ok}-SIZE {}\r\n{ok} 8BITMIME\r\n",
                    self.domain,
                    self.max_message_size,
                    ok = Status::Ok
                );
                self.send(&reply).await?;
            }
            Command::MailFrom(from) => {
                let result = self.session.mail_from(&from);
                self.respond(result.map(|()| "Ok")).await?;
            }
            Command::RcptTo(to) => {
                let result = self.session.rcpt_to(&to);
                self.respond(result.map(|()| "Ok")).await?;
            }
            Command::Data => self.data().await?,
            Command::Rset => {
                self.session.reset();
                self.reply(Status::Ok, "Ok").await?;
            }
            Command::Noop => self.reply(Status::Ok, "Ok").await?,
            Command::Quit => {
                self.session.logout();
                self.reply(Status::GoodBye, format!("{} closing connection", self.domain))
                    .await?;
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn data(&mut self) -> Result<(), ConnectionError> {
        if let Err(err) = self.session.ready_for_data() {
            return Ok(self.reply(err.status(), err).await?);
        }

        self.reply(Status::StartMailInput, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let session = &mut self.session;
        let mut body = DotReader::new(&mut self.stream);
        let received = tokio::time::timeout(self.data_timeout, async move {
            let outcome = session.data(&mut body).await;
            let drained = tokio::io::copy(&mut body, &mut tokio::io::sink()).await;
            (outcome, drained)
        })
        .await;
        self.session.reset();

        let Ok((outcome, drained)) = received else {
            self.reply(Status::Unavailable, "Timeout waiting for message data, closing connection")
                .await?;
            return Err(ConnectionError::Timeout(self.data_timeout.as_secs()));
        };
        drained?;

        match outcome {
            Ok(DataOutcome::Queued(queued)) => {
                self.reply(Status::Ok, format!("Ok: queued as {}", queued.content_id))
                    .await?;
            }
            Ok(DataOutcome::Discarded { .. }) => self.reply(Status::Ok, "Ok").await?,
            Err(err) => {
                internal!(level = INFO, "Message rejected: {err}");
                self.reply(err.status(), err).await?;
            }
        }

        Ok(())
    }

    async fn respond(
        &mut self,
        result: Result<&'static str, crate::SessionError>,
    ) -> io::Result<()> {
        match result {
            Ok(text) => self.reply(Status::Ok, text).await,
            Err(err) => self.reply(err.status(), err).await,
        }
    }

    async fn reply(&mut self, status: Status, text: impl Display + Send) -> io::Result<()> {
        self.send(&format!("{status} {text}\r\n")).await
    }

    async fn send(&mut self, reply: &str) -> io::Result<()> {
        outgoing!("{}", reply.trim_end());
        self.stream.write_all(reply.as_bytes()).await?;
        self.stream.flush().await
    }
}

/// Message body reader for the DATA phase.
///
/// Removes dot-stuffing and reports end of stream at the `<CRLF>.<CRLF>`
/// terminator, leaving the underlying reader positioned after it.
struct DotReader<'a, R> {
    inner: &'a mut R,
    line: Vec<u8>,
    offset: usize,
    scanning: bool,
    at_line_start: bool,
    finished: bool,
}

impl<'a, R> DotReader<'a, R> {
    const fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            line: Vec::new(),
            offset: 0,
            scanning: false,
            at_line_start: true,
            finished: false,
        }
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for DotReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.offset < this.line.len() {
                let n = buf.remaining().min(this.line.len() - this.offset);
                buf.put_slice(&this.line[this.offset..this.offset + n]);
                this.offset += n;
                return Poll::Ready(Ok(()));
            }

            if this.finished {
                return Poll::Ready(Ok(()));
            }

            if !this.scanning {
                this.line.clear();
                this.offset = 0;
                this.scanning = true;
            }

            let complete = loop {
                let available = ready!(Pin::new(&mut *this.inner).poll_fill_buf(cx))?;
                if available.is_empty() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed during DATA",
                    )));
                }

                let (used, complete) = match available.iter().position(|&b| b == b'\n') {
                    Some(end) => {
                        this.line.extend_from_slice(&available[..=end]);
                        (end + 1, true)
                    }
                    None => {
                        this.line.extend_from_slice(available);
                        (available.len(), false)
                    }
                };
                Pin::new(&mut *this.inner).consume(used);

                if complete || this.line.len() >= BODY_CHUNK {
                    break complete;
                }
            };
            this.scanning = false;

            if this.at_line_start {
                if complete && matches!(this.line.as_slice(), b".\r\n" | b".\n") {
                    this.finished = true;
                    this.line.clear();
                    return Poll::Ready(Ok(()));
                }

                if this.line.first() == Some(&b'.') {
                    this.offset = 1;
                }
            }
            this.at_line_start = complete;
        }
    }
}
