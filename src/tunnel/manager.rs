use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::registry::Stoppable;
use crate::relay;
use crate::security_log;
use crate::ssh::SshTransport;

/// Lifecycle of one tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Stopped,
    Starting,
    Running,
    Failed(String),
}

impl TunnelState {
    pub fn is_active(&self) -> bool {
        matches!(self, TunnelState::Starting | TunnelState::Running)
    }
}

/// Where a tunnel listens and what it forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Port on 127.0.0.1; 0 picks an ephemeral one
    pub local_port: u16,
    /// Target host as resolved by the SSH server
    pub remote_host: String,
    pub remote_port: u16,
    pub buffer_size: usize,
}

impl TunnelConfig {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            buffer_size: relay::DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// Statistics for a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (local -> remote)
    pub bytes_sent: u64,
    /// Total bytes received (remote -> local)
    pub bytes_received: u64,
}

struct RunningTunnel {
    local_addr: SocketAddr,
    stop_tx: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

/// Local port forward over one SSH connection.
///
/// Each accepted local socket gets its own direct-tcpip channel and relay
/// task. A channel that fails to open closes only that socket.
pub struct TunnelManager {
    config: TunnelConfig,
    connection: Arc<dyn SshTransport>,
    state: watch::Sender<TunnelState>,
    running: Mutex<Option<RunningTunnel>>,
    stats: Arc<RwLock<TunnelStats>>,
}

impl TunnelManager {
    pub fn new(connection: Arc<dyn SshTransport>, config: TunnelConfig) -> Self {
        let (state, _) = watch::channel(TunnelState::Stopped);
        Self {
            config,
            connection,
            state,
            running: Mutex::new(None),
            stats: Arc::new(RwLock::new(TunnelStats::default())),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        *self.state.borrow() == TunnelState::Running
    }

    /// Bound listener address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn stats(&self) -> TunnelStats {
        self.stats.read().clone()
    }

    /// Connect, bind and start accepting.
    ///
    /// Fails with `AlreadyConnected` while another start is in progress or
    /// the tunnel is running. On failure everything opened by this call is
    /// released and the state becomes `Failed`.
    pub async fn start(&self) -> Result<(), TunnelError> {
        let claimed = self.state.send_if_modified(|state| {
            if state.is_active() {
                false
            } else {
                *state = TunnelState::Starting;
                true
            }
        });
        if !claimed {
            return Err(TunnelError::AlreadyConnected);
        }

        let running = match self.open().await {
            Ok(running) => running,
            Err(e) => {
                warn!("Tunnel on port {} failed to start: {}", self.config.local_port, e);
                self.connection.close().await;
                // A concurrent stop() already settled the state
                self.state.send_if_modified(|state| {
                    if *state == TunnelState::Starting {
                        *state = TunnelState::Failed(e.to_string());
                        true
                    } else {
                        false
                    }
                });
                return Err(e);
            }
        };

        let local_addr = running.local_addr;
        *self.running.lock() = Some(running);

        // stop() may have run while we were connecting
        let promoted = self.state.send_if_modified(|state| {
            if *state == TunnelState::Starting {
                *state = TunnelState::Running;
                true
            } else {
                false
            }
        });
        if !promoted {
            let _ = self.shutdown_listener().await;
            self.connection.close().await;
            return Err(TunnelError::Shutdown(
                "tunnel was stopped while starting".to_string(),
            ));
        }

        security_log::log_tunnel_started(
            &local_addr.to_string(),
            &self.config.remote_host,
            self.config.remote_port,
        );
        info!(
            "Started tunnel: {} -> {}:{} via {}",
            local_addr,
            self.config.remote_host,
            self.config.remote_port,
            self.connection.target()
        );
        Ok(())
    }

    async fn open(&self) -> Result<RunningTunnel, TunnelError> {
        self.connection
            .connect()
            .await
            .map_err(TunnelError::ConnectionFailed)?;

        let addr = format!("127.0.0.1:{}", self.config.local_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TunnelError::Bind { addr: addr.clone(), source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind { addr, source })?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.connection.clone(),
            self.config.clone(),
            self.stats.clone(),
            stop_rx,
        ));

        Ok(RunningTunnel {
            local_addr,
            stop_tx,
            accept_task,
        })
    }

    /// Close the listener and every live relay, then the SSH connection.
    /// A start still connecting is aborted by the close. Idempotent.
    pub async fn stop(&self) -> Result<(), TunnelError> {
        let result = self.shutdown_listener().await;
        self.connection.close().await;
        self.state.send_replace(TunnelState::Stopped);
        result
    }

    async fn shutdown_listener(&self) -> Result<(), TunnelError> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };

        let _ = running.stop_tx.send(());
        let joined = running.accept_task.await;
        security_log::log_tunnel_stopped(&running.local_addr.to_string());

        match joined {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(TunnelError::Shutdown(e.to_string())),
        }
    }
}

#[async_trait]
impl Stoppable for TunnelManager {
    type Error = TunnelError;

    async fn stop(&self) -> Result<(), TunnelError> {
        TunnelManager::stop(self).await
    }
}

async fn accept_loop(
    listener: TcpListener,
    connection: Arc<dyn SshTransport>,
    config: TunnelConfig,
    stats: Arc<RwLock<TunnelStats>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut relays = JoinSet::new();

    loop {
        tokio::select! {
            // Also fires when the manager is dropped
            _ = &mut stop_rx => break,

            Some(_) = relays.join_next(), if !relays.is_empty() => {}

            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    // Disable Nagle's algorithm for low-latency forwarding
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                    debug!("Accepted connection from {} for tunnel", peer_addr);

                    {
                        let mut s = stats.write();
                        s.connection_count += 1;
                        s.active_connections += 1;
                    }

                    relays.spawn(forward_connection(
                        connection.clone(),
                        stream,
                        config.clone(),
                        stats.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Tunnel accept error: {}", e);
                    // Small delay before retrying
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    drop(listener);
    // Aborting a relay drops both of its streams, closing socket and channel
    relays.shutdown().await;
    stats.write().active_connections = 0;
    debug!("Tunnel accept loop exited");
}

async fn forward_connection(
    connection: Arc<dyn SshTransport>,
    stream: TcpStream,
    config: TunnelConfig,
    stats: Arc<RwLock<TunnelStats>>,
) {
    match connection
        .open_direct_channel(&config.remote_host, config.remote_port)
        .await
    {
        Ok(channel) => {
            let moved = relay::relay(stream, channel, config.buffer_size).await;
            let mut s = stats.write();
            s.bytes_sent += moved.a_to_b;
            s.bytes_received += moved.b_to_a;
        }
        Err(e) => {
            warn!(
                "Tunnel channel to {}:{} failed: {}",
                config.remote_host, config.remote_port, e
            );
            drop(stream);
        }
    }

    let mut s = stats.write();
    s.active_connections = s.active_connections.saturating_sub(1);
}
