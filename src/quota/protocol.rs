//! Quota authority wire protocol
//!
//! One command per connection, line oriented:
//!
//! ```text
//! S: Welcome ...\n
//! C: quota use 42 1048576\r\n
//! S: ok 3145728\n              (or any other line: error message)
//! ```

use super::QuotaError;
use crate::identity::UserId;

use std::fmt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

pub const GREETING_PREFIX: &str = "Welcome";
pub const OK_PREFIX: &str = "ok ";

/// Commands understood by the quota authority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `quota use <user> <delta>`
    UseUser { user: UserId, delta: i64 },
    /// `quota left <user>`
    LeftUser { user: UserId },
    /// `quota use app <delta>`
    UseApp { delta: i64 },
    /// `quota left app`
    LeftApp,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::UseUser { user, delta } => write!(f, "quota use {} {}", user, delta),
            Command::LeftUser { user } => write!(f, "quota left {}", user),
            Command::UseApp { delta } => write!(f, "quota use app {}", delta),
            Command::LeftApp => write!(f, "quota left app"),
        }
    }
}

impl Command {
    /// Bytes sent on the wire for this command
    pub fn to_line(&self) -> String {
        format!("{}\r\n", self)
    }
}

/// Check the server greeting
pub fn check_greeting(line: &str) -> Result<(), QuotaError> {
    if line.starts_with(GREETING_PREFIX) {
        Ok(())
    } else {
        Err(QuotaError::Protocol(format!(
            "unexpected answer from server: {}",
            line.trim_end()
        )))
    }
}

/// Parse the single reply line into the quota value it carries
pub fn parse_reply(line: &str) -> Result<i64, QuotaError> {
    let Some(value) = line.strip_prefix(OK_PREFIX) else {
        return Err(QuotaError::Protocol(format!(
            "error from server: {}",
            line.trim_end()
        )));
    };

    let value = value.trim_end_matches([' ', '\r', '\n']);
    value
        .parse()
        .map_err(|_| QuotaError::Protocol(format!("malformed quota value: {:?}", value)))
}

/// Run one command over an established connection.
///
/// I/O failures are transport errors; anything the server says that does
/// not follow the protocol is a protocol error.
pub async fn exchange<S>(stream: S, command: Command) -> Result<i64, QuotaError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);

    let greeting = read_line(&mut stream).await?;
    tracing::debug!("< {}", greeting.trim_end());
    check_greeting(&greeting)?;

    let line = command.to_line();
    tracing::debug!("> {}", line.trim_end());
    stream.write_all(line.as_bytes()).await.map_err(transport)?;
    stream.flush().await.map_err(transport)?;

    let reply = read_line(&mut stream).await?;
    tracing::debug!("< {}", reply.trim_end());
    parse_reply(&reply)
}

async fn read_line<S>(stream: &mut BufReader<S>) -> Result<String, QuotaError>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let n = stream.read_line(&mut line).await.map_err(transport)?;
    if n == 0 {
        return Err(QuotaError::Transport("connection closed by quota service".into()));
    }
    Ok(line)
}

fn transport(e: std::io::Error) -> QuotaError {
    QuotaError::Transport(e.to_string())
}
