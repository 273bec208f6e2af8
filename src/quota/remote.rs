//! Remote Authority Backend - client of the external quota service
//!
//! Every call opens a fresh TCP connection, runs exactly one command and
//! closes. Calls are already batched behind the writer's cache window, so
//! connection reuse is not worth the extra state.

use super::protocol::{self, Command};
use super::{QuotaBackend, QuotaError};
use crate::identity::UserId;

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Quota accounts held by a remote authority
#[derive(Debug, Clone)]
pub struct RemoteAuthorityBackend {
    addr: String,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl RemoteAuthorityBackend {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.connect_timeout = connect;
        self.io_timeout = io;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn command(&self, command: Command) -> Result<i64, QuotaError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| QuotaError::Transport(format!("connect to {} timed out", self.addr)))?
            .map_err(|e| QuotaError::Transport(format!("{}: {}", self.addr, e)))?;

        timeout(self.io_timeout, protocol::exchange(stream, command))
            .await
            .map_err(|_| {
                QuotaError::Transport(format!(
                    "{} did not answer `{}` in time",
                    self.addr, command
                ))
            })?
    }
}

// The authority serves a single application, so `app` only scopes logs.
#[async_trait]
impl QuotaBackend for RemoteAuthorityBackend {
    fn name(&self) -> &str {
        "remote-authority"
    }

    async fn register_app_space(&self, app: &str, delta: i64) -> Result<(), QuotaError> {
        tracing::debug!("Registering {} bytes for application {}", delta, app);
        self.command(Command::UseApp { delta }).await.map(|_| ())
    }

    async fn register_user_space(
        &self,
        user: UserId,
        app: &str,
        delta: i64,
    ) -> Result<(), QuotaError> {
        tracing::debug!("Registering {} bytes for user {} of {}", delta, user, app);
        self.command(Command::UseUser { user, delta }).await.map(|_| ())
    }

    async fn get_app_quota(&self, _app: &str) -> Result<i64, QuotaError> {
        self.command(Command::LeftApp).await
    }

    async fn get_user_quota(&self, user: UserId, _app: &str) -> Result<i64, QuotaError> {
        self.command(Command::LeftUser { user }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Minimal authority speaking the line protocol, for one application
    async fn spawn_authority(
        app_quota: i64,
        user_quota: i64,
    ) -> (String, Arc<parking_lot::Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let accounts = Arc::new(parking_lot::Mutex::new(HashMap::from([
            ("app".to_string(), app_quota),
            ("7".to_string(), user_quota),
        ])));

        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let log = log.clone();
                let accounts = accounts.clone();
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut lines = BufReader::new(read).lines();
                    write.write_all(b"Welcome to quota service\n").await.unwrap();

                    let Some(line) = lines.next_line().await.unwrap() else {
                        return;
                    };
                    log.lock().push(line.clone());

                    let words: Vec<&str> = line.split_whitespace().collect();
                    let reply = match words.as_slice() {
                        ["quota", "left", who] => match accounts.lock().get(*who) {
                            Some(left) => format!("ok {}\n", left),
                            None => format!("unknown account {}\n", who),
                        },
                        ["quota", "use", who, delta] => {
                            let delta: i64 = delta.parse().unwrap();
                            let mut accounts = accounts.lock();
                            let left = accounts.entry(who.to_string()).or_insert(0);
                            *left -= delta;
                            format!("ok {}\n", left)
                        }
                        _ => "bad command\n".to_string(),
                    };
                    write.write_all(reply.as_bytes()).await.unwrap();
                });
            }
        });

        (addr, seen)
    }

    #[tokio::test]
    async fn test_register_and_query() {
        let (addr, seen) = spawn_authority(1000, 600).await;
        let backend = RemoteAuthorityBackend::new(addr);
        let user = UserId::new(7);

        backend.register_space(user, "notes", 250).await.unwrap();

        assert_eq!(backend.get_app_quota("notes").await.unwrap(), 750);
        assert_eq!(backend.get_user_quota(user, "notes").await.unwrap(), 350);
        assert_eq!(
            *seen.lock(),
            vec![
                "quota use app 250",
                "quota use 7 250",
                "quota left app",
                "quota left 7",
            ]
        );
    }

    #[tokio::test]
    async fn test_server_error_is_protocol_error() {
        let (addr, _) = spawn_authority(1000, 600).await;
        let backend = RemoteAuthorityBackend::new(addr);

        match backend.get_user_quota(UserId::new(8), "notes").await {
            Err(QuotaError::Protocol(msg)) => assert!(msg.contains("unknown account 8")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_authority() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let backend = RemoteAuthorityBackend::new(addr);
        assert!(matches!(
            backend.get_app_quota("notes").await,
            Err(QuotaError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_authority_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // Accept and never greet
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let backend = RemoteAuthorityBackend::new(addr)
            .with_timeouts(Duration::from_secs(1), Duration::from_millis(100));
        assert!(matches!(
            backend.get_app_quota("notes").await,
            Err(QuotaError::Transport(_))
        ));
    }
}
