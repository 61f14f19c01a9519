//! SSH client sessions to instances
//!
//! Host keys are not verified: instances are reached right after boot,
//! before any host key could have been recorded.

use crate::forward::{Connector, ForwardSession, ForwardStream};
use crate::keys::SshKey;
use async_trait::async_trait;
use meshlink_common::{Error, Result};
use russh::client::{self, Handle};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::Disconnect;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Default connection attempts before an endpoint is declared unreachable
pub const DEFAULT_RETRIES: u32 = 20;

/// Default pause between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Credentials presented to the remote sshd
#[derive(Clone)]
pub enum AuthMethod {
    Password(String),
    PublicKey(Arc<PrivateKey>),
}

impl From<&SshKey> for AuthMethod {
    fn from(key: &SshKey) -> Self {
        AuthMethod::PublicKey(key.private_key())
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(..)"),
            AuthMethod::PublicKey(_) => f.write_str("PublicKey(..)"),
        }
    }
}

struct AcceptAnyKey;

impl client::Handler for AcceptAnyKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An authenticated SSH connection
pub struct SshSession {
    handle: Handle<AcceptAnyKey>,
    remote: String,
}

impl SshSession {
    /// Connect and authenticate once.
    ///
    /// Transport failures are `Transient`; a rejected login is
    /// `PermissionDenied`.
    #[instrument(skip(auth), fields(remote = %remote, user = %user))]
    pub async fn connect(remote: &str, user: &str, auth: &AuthMethod) -> Result<Self> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(15)),
            ..Default::default()
        });

        let mut handle = client::connect(config, remote, AcceptAnyKey)
            .await
            .map_err(|e| Error::Transient(format!("cannot reach {}: {}", remote, e)))?;

        let auth_result = match auth {
            AuthMethod::Password(password) => {
                handle.authenticate_password(user, password.as_str()).await
            }
            AuthMethod::PublicKey(key) => {
                handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), None))
                    .await
            }
        }
        .map_err(|e| Error::Ssh(format!("authentication with {} failed: {}", remote, e)))?;

        if !auth_result.success() {
            return Err(Error::PermissionDenied(format!(
                "{} rejected the credentials for {}",
                remote, user
            )));
        }

        info!("SSH session established");
        Ok(Self {
            handle,
            remote: remote.to_string(),
        })
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }
}

#[async_trait]
impl ForwardSession for SshSession {
    async fn open_forward(&self, host: &str, port: u16, origin: SocketAddr) -> Result<ForwardStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                host,
                port.into(),
                origin.ip().to_string(),
                origin.port().into(),
            )
            .await
            .map_err(ssh_error)?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(ssh_error)
    }
}

/// Retry `SshSession::connect` while the endpoint is unreachable.
///
/// Only `Transient` failures are retried; the last one is returned once
/// `retries` attempts are spent.
pub async fn connect_with_retry(
    remote: &str,
    user: &str,
    auth: &AuthMethod,
    retries: u32,
    delay: Duration,
) -> Result<SshSession> {
    retry_transient(remote, retries, delay, || SshSession::connect(remote, user, auth)).await
}

async fn retry_transient<T, F, Fut>(
    remote: &str,
    retries: u32,
    delay: Duration,
    mut attempt_once: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let retries = retries.max(1);
    let mut attempt = 1;

    loop {
        match attempt_once().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < retries => {
                warn!(
                    "SSH to {} not ready (attempt {}/{}): {}",
                    remote, attempt, retries, e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                return Err(Error::Transient(format!(
                    "{} still unreachable after {} attempts: {}",
                    remote, retries, e
                )))
            }
            Err(e) => return Err(e),
        }
    }
}

/// Connector dialing an instance over SSH with a bounded retry budget
#[derive(Debug, Clone)]
pub struct SshConnector {
    remote: String,
    user: String,
    auth: AuthMethod,
    retries: u32,
    delay: Duration,
}

impl SshConnector {
    pub fn new(remote: impl Into<String>, user: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            remote: remote.into(),
            user: user.into(),
            auth,
            retries: DEFAULT_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Session = SshSession;

    fn remote(&self) -> &str {
        &self.remote
    }

    async fn connect(&self) -> Result<SshSession> {
        debug!("Connecting to {} as {}", self.remote, self.user);
        connect_with_retry(&self.remote, &self.user, &self.auth, self.retries, self.delay).await
    }
}

fn ssh_error(e: russh::Error) -> Error {
    Error::Ssh(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn closed_port() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[test]
    fn test_auth_debug_hides_secret() {
        let auth = AuthMethod::Password("hunter2".to_string());
        assert_eq!(format!("{:?}", auth), "Password(..)");

        let key = SshKey::from_seed(&[2; 32]).unwrap();
        assert_eq!(format!("{:?}", AuthMethod::from(&key)), "PublicKey(..)");
    }

    #[tokio::test]
    async fn test_unreachable_is_transient() {
        let remote = closed_port().await;
        let auth = AuthMethod::Password("x".to_string());
        let err = SshSession::connect(&remote, "root", &auth).await.err().unwrap();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let remote = closed_port().await;
        let auth = AuthMethod::Password("x".to_string());

        let started = std::time::Instant::now();
        let err = connect_with_retry(&remote, "root", &auth, 3, Duration::from_millis(20))
            .await
            .err()
            .unwrap();

        assert!(err.is_transient());
        assert!(err.to_string().contains("after 3 attempts"));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_retry_succeeds_within_budget() {
        let attempts = AtomicU32::new(0);
        let value = retry_transient("10.0.0.5:22", 5, Duration::from_millis(1), || async {
            match attempts.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(Error::Transient("connection refused".to_string())),
                _ => Ok("session"),
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "session");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_rejected_credentials() {
        let attempts = AtomicU32::new(0);
        let err = retry_transient("10.0.0.5:22", 5, Duration::from_millis(1), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::PermissionDenied("rejected".to_string()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::PermissionDenied(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
