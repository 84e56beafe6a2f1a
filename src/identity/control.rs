//! Control-port client speaking the Tor control protocol.
//!
//! Commands are single CRLF-terminated lines. Replies are one or more lines of the form
//! `NNN-text` (more lines follow), `NNN+text` (a data block terminated by a lone `.` follows) or
//! `NNN text` (final line).

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::ControlError;

/// Exclusively owned, authenticated control connection.
#[async_trait]
pub trait ControlChannel: Send + std::fmt::Debug {
    /// Ask the network for a fresh circuit.
    async fn signal_new_identity(&mut self) -> Result<(), ControlError>;

    /// Release the connection. Further signals fail with [`ControlError::Closed`].
    async fn close(&mut self) -> Result<(), ControlError>;
}

/// Parsed control-port reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl ControlReply {
    pub fn is_ok(&self) -> bool {
        self.code == 250
    }

    /// Reply text joined into one line.
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }
}

/// TCP control channel to a local Tor daemon.
#[derive(Debug)]
pub struct TorControlChannel {
    addr: String,
    stream: Option<BufReader<TcpStream>>,
}

impl TorControlChannel {
    /// Connect to `addr` and authenticate with `password`.
    ///
    /// Any failure here is fatal: a rotator without a working channel cannot rotate.
    pub async fn connect(addr: &str, password: &str) -> Result<Self, ControlError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ControlError::Connect { addr: addr.to_string(), source })?;
        let mut channel = Self { addr: addr.to_string(), stream: Some(BufReader::new(stream)) };

        let reply = channel.command(&format!("AUTHENTICATE {}", quote(password))).await?;
        if !reply.is_ok() {
            return Err(ControlError::Authentication(format!("{} {}", reply.code, reply.message())));
        }
        info!(target: "crawlguard::identity", addr = %channel.addr, "control port authenticated");
        Ok(channel)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one command line and read its reply.
    pub async fn command(&mut self, line: &str) -> Result<ControlReply, ControlError> {
        let stream = self.stream.as_mut().ok_or(ControlError::Closed)?;
        stream.get_mut().write_all(line.as_bytes()).await?;
        stream.get_mut().write_all(b"\r\n").await?;
        stream.get_mut().flush().await?;
        read_reply(stream).await
    }
}

#[async_trait]
impl ControlChannel for TorControlChannel {
    async fn signal_new_identity(&mut self) -> Result<(), ControlError> {
        let reply = self.command("SIGNAL NEWNYM").await?;
        if !reply.is_ok() {
            return Err(ControlError::Protocol(format!("{} {}", reply.code, reply.message())));
        }
        debug!(target: "crawlguard::identity", "NEWNYM accepted");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ControlError> {
        if self.stream.is_none() {
            return Ok(());
        }
        // The daemon may drop the socket before answering QUIT.
        let quit = self.command("QUIT").await;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().shutdown().await;
        }
        info!(target: "crawlguard::identity", addr = %self.addr, "control port closed");
        match quit {
            Ok(_) | Err(ControlError::Closed) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Quote a string argument, escaping backslashes and double quotes.
pub(crate) fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '\\' || ch == '"' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// Read one complete reply.
pub(crate) async fn read_reply<R>(reader: &mut R) -> Result<ControlReply, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
            return Err(ControlError::Protocol(format!("malformed reply line {line:?}")));
        }
        let code: u16 = line[..3]
            .parse()
            .map_err(|_| ControlError::Protocol(format!("malformed reply code {line:?}")))?;
        let text = line[4..].to_string();
        match &line[3..4] {
            " " => {
                lines.push(text);
                return Ok(ControlReply { code, lines });
            }
            "-" => lines.push(text),
            "+" => {
                lines.push(text);
                loop {
                    let data = read_line(reader).await?;
                    if data == "." {
                        break;
                    }
                    lines.push(data);
                }
            }
            other => {
                return Err(ControlError::Protocol(format!("unknown reply separator {other:?}")))
            }
        }
    }
}

async fn read_line<R>(reader: &mut R) -> Result<String, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = String::new();
    if reader.read_line(&mut buf).await? == 0 {
        return Err(ControlError::Closed);
    }
    Ok(buf.trim_end_matches(['\r', '\n']).to_string())
}
