//! Minimal SMTP client speaking just enough to submit a message

use std::net::SocketAddr;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

/// A final reply line, continuation lines dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code < 400
    }
}

pub struct SmtpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SmtpClient {
    /// Connect and read the greeting
    pub async fn connect(address: SocketAddr) -> anyhow::Result<(Self, Reply)> {
        let (reader, writer) = TcpStream::connect(address).await?.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };

        let greeting = client.reply().await?;
        Ok((client, greeting))
    }

    pub async fn command(&mut self, line: &str) -> anyhow::Result<Reply> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.reply().await
    }

    /// Send a message body after a positive `DATA` reply, dot-stuffing it
    pub async fn body(&mut self, message: &str) -> anyhow::Result<Reply> {
        let mut wire = String::with_capacity(message.len() + 5);
        for line in message.split_inclusive("\r\n") {
            if line.starts_with('.') {
                wire.push('.');
            }
            wire.push_str(line);
        }
        if !wire.ends_with("\r\n") {
            wire.push_str("\r\n");
        }
        wire.push_str(".\r\n");

        self.writer.write_all(wire.as_bytes()).await?;
        self.reply().await
    }

    pub async fn reply(&mut self) -> anyhow::Result<Reply> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                anyhow::bail!("Connection closed while waiting for a reply");
            }

            if line.as_bytes().get(3) != Some(&b'-') {
                break;
            }
        }

        let code = line
            .get(..3)
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("Malformed reply: {line:?}"))?;

        Ok(Reply {
            code,
            text: line.get(4..).unwrap_or_default().trim_end().to_string(),
        })
    }
}
