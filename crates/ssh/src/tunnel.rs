//! Local port forwarding through an SSH session
//!
//! A tunnel listens on an ephemeral loopback port and forwards every
//! accepted connection to a fixed target on the remote side. Lifecycle:
//! `Created -> Starting -> Running -> Closed`.

use crate::forward::{forward, Connector, ForwardOutcome, ForwardSession};
use crate::session::{AuthMethod, SshConnector};
use meshlink_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Remote side address every connection is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
}

impl std::str::FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidConfig(format!("tunnel target '{}' has no port", s)))?;
        let port = port
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid port in tunnel target '{}'", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "tunnel target '{}' has no host",
                s
            )));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Live forwarded connections, each with its own cancellation token
struct Connections {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, CancellationToken>>,
    tracker: TaskTracker,
}

impl Connections {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            live: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
        }
    }

    fn register(&self) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.live.lock().insert(id, token.clone());
        (id, token)
    }

    fn remove(&self, id: u64) {
        self.live.lock().remove(&id);
    }

    fn cancel_all(&self) {
        for (_, token) in self.live.lock().drain() {
            token.cancel();
        }
    }

    fn len(&self) -> usize {
        self.live.lock().len()
    }
}

struct Running<S> {
    port: u16,
    session: Arc<S>,
    shutdown: CancellationToken,
    accept: JoinHandle<()>,
    connections: Arc<Connections>,
}

enum State<S> {
    Created,
    Starting,
    Running(Running<S>),
    Closed,
}

/// An SSH port-forwarding tunnel
pub struct Tunnel<C: Connector = SshConnector> {
    connector: C,
    target: Arc<Target>,
    span: Span,
    state: Mutex<State<C::Session>>,
    /// Signalled when a start interrupted by `close` has finished tearing down
    settled: Notify,
}

impl Tunnel<SshConnector> {
    /// Tunnel to `target` (as seen from `remote`) through SSH.
    ///
    /// `remote` is `host:port` of the sshd.
    pub fn new(
        remote: impl Into<String>,
        user: impl Into<String>,
        auth: AuthMethod,
        target: &str,
    ) -> Result<Self> {
        Self::with_connector(SshConnector::new(remote, user, auth), target)
    }
}

impl<C: Connector> Tunnel<C> {
    pub fn with_connector(connector: C, target: &str) -> Result<Self> {
        let target: Target = target.parse()?;
        let span = info_span!("tunnel", remote = %connector.remote(), target = %target);
        Ok(Self {
            connector,
            target: Arc::new(target),
            span,
            state: Mutex::new(State::Created),
            settled: Notify::new(),
        })
    }

    /// Local port of a running tunnel
    pub fn local_port(&self) -> Option<u16> {
        match &*self.state.lock() {
            State::Running(running) => Some(running.port),
            _ => None,
        }
    }

    /// Number of connections currently being forwarded
    pub fn active_connections(&self) -> usize {
        match &*self.state.lock() {
            State::Running(running) => running.connections.len(),
            _ => 0,
        }
    }

    /// Bind the local listener, connect the session and start accepting.
    ///
    /// Returns the local port. A failed start leaves the tunnel startable.
    pub async fn start(&self) -> Result<u16> {
        {
            let mut state = self.state.lock();
            match *state {
                State::Created => *state = State::Starting,
                State::Closed => return Err(Error::Internal("tunnel is closed".to_string())),
                _ => return Err(Error::Internal("tunnel already started".to_string())),
            }
        }

        let result = self.launch().instrument(self.span.clone()).await;

        let running = {
            let mut state = self.state.lock();
            match result {
                Ok(running) if matches!(*state, State::Starting) => {
                    let port = running.port;
                    *state = State::Running(running);
                    return Ok(port);
                }
                Ok(running) => running,
                Err(e) => {
                    if matches!(*state, State::Starting) {
                        *state = State::Created;
                    } else {
                        self.settled.notify_one();
                    }
                    return Err(e);
                }
            }
        };

        // closed while starting
        if let Err(e) = shutdown(running).instrument(self.span.clone()).await {
            warn!(parent: &self.span, "teardown after interrupted start failed: {}", e);
        }
        self.settled.notify_one();
        Err(Error::Internal("tunnel closed during start".to_string()))
    }

    async fn launch(&self) -> Result<Running<C::Session>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let session = Arc::new(self.connector.connect().await?);

        let shutdown = CancellationToken::new();
        let connections = Arc::new(Connections::new());
        let accept = tokio::spawn(
            accept_loop(
                listener,
                session.clone(),
                self.target.clone(),
                shutdown.clone(),
                connections.clone(),
            )
            .instrument(Span::current()),
        );

        info!("Tunnel listening on 127.0.0.1:{}", port);
        Ok(Running {
            port,
            session,
            shutdown,
            accept,
            connections,
        })
    }

    /// Stop the tunnel.
    ///
    /// Stops the listener and waits for the accept loop to exit, then
    /// cancels every forwarded connection and waits for them, then closes
    /// the session. A close racing a `start` waits until that start has
    /// released its listener and session. Closing a tunnel that is not
    /// running is a no-op.
    pub async fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock(), State::Closed);
        let running = match previous {
            State::Running(running) => running,
            State::Closed => {
                debug!(parent: &self.span, "tunnel already closed");
                return Ok(());
            }
            State::Starting => {
                self.settled.notified().await;
                return Ok(());
            }
            State::Created => return Ok(()),
        };

        shutdown(running).instrument(self.span.clone()).await?;
        info!(parent: &self.span, "Tunnel closed");
        Ok(())
    }
}

async fn shutdown<S: ForwardSession>(running: Running<S>) -> Result<()> {
    running.shutdown.cancel();
    if let Err(e) = running.accept.await {
        warn!("accept loop ended abnormally: {}", e);
    }

    running.connections.cancel_all();
    running.connections.tracker.close();
    running.connections.tracker.wait().await;

    running.session.close().await
}

impl<C: Connector> Drop for Tunnel<C> {
    fn drop(&mut self) {
        if let State::Running(running) = self.state.get_mut() {
            running.shutdown.cancel();
            running.connections.cancel_all();
        }
    }
}

async fn accept_loop<S: ForwardSession>(
    listener: TcpListener,
    session: Arc<S>,
    target: Arc<Target>,
    shutdown: CancellationToken,
    connections: Arc<Connections>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((local, peer)) => {
                let (id, cancel) = connections.register();
                let span = info_span!("forward", id, %peer);
                connections.tracker.spawn(
                    forward_connection(
                        local,
                        peer,
                        session.clone(),
                        target.clone(),
                        cancel,
                        connections.clone(),
                        id,
                    )
                    .instrument(span),
                );
            }
            Err(e) => {
                error!("failed to accept tunnel connection: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }

    debug!("listener closed, no longer accepting connections");
}

async fn forward_connection<S: ForwardSession>(
    local: TcpStream,
    peer: SocketAddr,
    session: Arc<S>,
    target: Arc<Target>,
    cancel: CancellationToken,
    connections: Arc<Connections>,
    id: u64,
) {
    debug!("new forwarded connection");

    let remote = tokio::select! {
        _ = cancel.cancelled() => None,
        opened = session.open_forward(&target.host, target.port, peer) => match opened {
            Ok(stream) => Some(stream),
            Err(e) => {
                error!("failed to reach {} through the tunnel: {}", target, e);
                None
            }
        },
    };

    if let Some(remote) = remote {
        match forward(local, remote, cancel).await {
            ForwardOutcome::Failed(e) => warn!("forwarding failed: {}", e),
            ForwardOutcome::Cancelled => debug!("forwarding cancelled"),
            ForwardOutcome::Finished { to_remote, to_local } => {
                debug!("connection done ({} bytes out, {} bytes in)", to_remote, to_local)
            }
        }
    }

    connections.remove(id);
}
