//! One authenticated SSH session per server, shared by tunnels and the gateway.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::Disconnect;
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;

use crate::config::{ServerConfig, SshSettings};
use crate::error::{SftpError, SshError};
use crate::secrets::SecretStore;
use crate::security_log;
use crate::sftp::{RemoteFs, SftpSession};

use super::auth::ResolvedAuth;
use super::handler::{ClientHandler, HostKeyPolicy};

/// Bidirectional byte stream a relay can splice
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayStream for T {}

/// A forwarded TCP stream over the SSH session. Dropping it closes the channel.
pub type DirectChannel = Box<dyn RelayStream>;

/// What tunnels and gateways need from an SSH session.
///
/// Reconnecting means building a new transport; a closed one stays closed.
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Handshake and authenticate. A no-op when already open.
    async fn connect(&self) -> Result<(), SshError>;

    /// Open a direct-tcpip channel to `host:port` as seen from the server
    async fn open_direct_channel(&self, host: &str, port: u16) -> Result<DirectChannel, SshError>;

    /// The SFTP sub-session, opened on first use and cached for the
    /// lifetime of the connection
    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>, SftpError>;

    /// Close the SFTP sub-session and the transport. Idempotent.
    async fn close(&self);

    fn is_open(&self) -> bool;

    /// `user@host:port`, for logs and status text
    fn target(&self) -> String;
}

/// Builds transports for a server. The orchestrator asks for a fresh one
/// on every (re)connect.
pub trait SshConnector: Send + Sync {
    fn connection(&self, server: &ServerConfig) -> Arc<dyn SshTransport>;
}

#[derive(Default)]
struct ConnectionState {
    handle: Option<Arc<Handle<ClientHandler>>>,
    sftp: Option<Arc<SftpSession>>,
    closed: bool,
}

/// russh backed [`SshTransport`]
///
/// `handshake` serialises connect attempts and is held across network I/O.
/// `state` is only held briefly, so `close` never waits on a handshake; it
/// flips `closing` instead, which aborts whatever is in flight.
pub struct SshConnection {
    server: ServerConfig,
    secrets: Arc<dyn SecretStore>,
    service: String,
    settings: SshSettings,
    policy: HostKeyPolicy,
    handshake: Mutex<()>,
    sftp_init: Mutex<()>,
    state: Mutex<ConnectionState>,
    closing: watch::Sender<bool>,
    open: AtomicBool,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("target", &self.target())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl SshConnection {
    pub fn new(
        server: ServerConfig,
        secrets: Arc<dyn SecretStore>,
        service: impl Into<String>,
        settings: SshSettings,
        policy: HostKeyPolicy,
    ) -> Self {
        Self {
            server,
            secrets,
            service: service.into(),
            settings,
            policy,
            handshake: Mutex::new(()),
            sftp_init: Mutex::new(()),
            state: Mutex::new(ConnectionState::default()),
            closing: watch::channel(false).0,
            open: AtomicBool::new(false),
        }
    }

    fn client_config(&self) -> Config {
        // Treat 0 as "no keepalive" to avoid immediate timeout
        let keepalive = if self.settings.keepalive_interval_secs == 0 {
            None
        } else {
            Some(self.settings.keepalive_interval())
        };

        Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            keepalive_interval: keepalive,
            keepalive_max: self.settings.keepalive_max,
            ..Default::default()
        }
    }

    async fn establish(&self) -> Result<Handle<ClientHandler>, SshError> {
        let host = self.server.host.trim().to_string();
        let port = self.server.port;
        let connection_timeout = self.settings.connection_timeout();

        // Resolve before dialing so a missing secret never costs a handshake
        let auth = ResolvedAuth::resolve(&self.server, self.secrets.as_ref(), &self.service)?;

        let addr = format!("{}:{}", host, port);
        let stream = timeout(connection_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SshError::Timeout(addr.clone()))?
            .map_err(|e| SshError::NetworkUnreachable {
                host: host.clone(),
                port,
                reason: e.to_string(),
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let handler = ClientHandler::new(host.clone(), port, self.policy.clone());
        let config = Arc::new(self.client_config());

        let mut handle = timeout(connection_timeout, client::connect_stream(config, stream, handler))
            .await
            .map_err(|_| SshError::Timeout(addr.clone()))?
            .map_err(|e| match e {
                SshError::HostKeyVerification(_) => e,
                other => SshError::NetworkUnreachable {
                    host: host.clone(),
                    port,
                    reason: format!("SSH handshake failed: {}", other),
                },
            })?;

        timeout(
            connection_timeout,
            authenticate(&mut handle, &self.server.user, auth, &host, port),
        )
        .await
        .map_err(|_| SshError::Timeout(addr))??;

        Ok(handle)
    }

    async fn live_handle(&self) -> Result<Arc<Handle<ClientHandler>>, SshError> {
        let state = self.state.lock().await;
        match &state.handle {
            Some(handle) if !state.closed && !handle.is_closed() => Ok(handle.clone()),
            _ => Err(SshError::NotConnected),
        }
    }
}

#[async_trait]
impl SshTransport for SshConnection {
    async fn connect(&self) -> Result<(), SshError> {
        // At most one authentication in flight
        let _handshake = self.handshake.lock().await;
        let mut closing = self.closing.subscribe();

        {
            let state = self.state.lock().await;
            if state.closed {
                return Err(SshError::NotConnected);
            }
            if state.handle.as_ref().is_some_and(|h| !h.is_closed()) {
                return Ok(());
            }
        }

        if let Err(field) = self.server.validate_ssh() {
            return Err(SshError::InvalidConfiguration(format!(
                "server '{}' is missing {}",
                self.server.name, field
            )));
        }

        let handle = tokio::select! {
            result = self.establish() => result?,
            _ = closed_signal(&mut closing) => {
                tracing::debug!("Handshake with {} abandoned: connection closed", self.target());
                return Err(SshError::NotConnected);
            }
        };

        let mut state = self.state.lock().await;
        if state.closed {
            drop(state);
            let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
            return Err(SshError::NotConnected);
        }
        state.handle = Some(Arc::new(handle));
        self.open.store(true, Ordering::SeqCst);
        tracing::info!("SSH connection established to {}", self.target());
        Ok(())
    }

    async fn open_direct_channel(&self, host: &str, port: u16) -> Result<DirectChannel, SshError> {
        let handle = self.live_handle().await?;
        let channel = handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                SshError::Channel(format!("direct-tcpip to {}:{} failed: {}", host, port, e))
            })?;
        tracing::debug!("Opened channel for forward to {}:{}", host, port);
        Ok(Box::new(channel.into_stream()))
    }

    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>, SftpError> {
        let _init = self.sftp_init.lock().await;
        let mut closing = self.closing.subscribe();

        let handle = {
            let state = self.state.lock().await;
            if let Some(sftp) = &state.sftp {
                return Ok(sftp.clone());
            }
            match &state.handle {
                Some(handle) if !state.closed && !handle.is_closed() => handle.clone(),
                _ => return Err(SshError::NotConnected.into()),
            }
        };

        let session = tokio::select! {
            result = start_sftp(&handle, self.target()) => result?,
            _ = closed_signal(&mut closing) => return Err(SshError::NotConnected.into()),
        };

        let mut state = self.state.lock().await;
        if state.closed {
            drop(state);
            let _ = session.close().await;
            return Err(SshError::NotConnected.into());
        }
        security_log::log_sftp_connect(&self.server.host, self.server.port, &self.server.user);
        state.sftp = Some(session.clone());
        Ok(session)
    }

    async fn close(&self) {
        // Wakes any handshake or SFTP start still in flight
        self.closing.send_replace(true);

        let mut state = self.state.lock().await;
        state.closed = true;
        self.open.store(false, Ordering::SeqCst);

        if let Some(sftp) = state.sftp.take() {
            if let Err(e) = sftp.close().await {
                tracing::debug!("SFTP close for {}: {}", self.target(), e);
            }
        }

        if let Some(handle) = state.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                tracing::debug!("SSH disconnect for {}: {}", self.target(), e);
            }
            security_log::log_ssh_disconnect(&self.server.host, self.server.port);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn target(&self) -> String {
        format!("{}@{}:{}", self.server.user, self.server.host, self.server.port)
    }
}

/// Resolves once the connection has been closed
async fn closed_signal(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closed| *closed).await;
}

async fn start_sftp(handle: &Handle<ClientHandler>, target: String) -> Result<Arc<SftpSession>, SftpError> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| SftpError::ConnectionFailed(format!("Failed to open channel: {}", e)))?;

    channel
        .request_subsystem(false, "sftp")
        .await
        .map_err(|e| {
            SftpError::ConnectionFailed(format!("Failed to request SFTP subsystem: {}", e))
        })?;

    let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| {
            SftpError::ConnectionFailed(format!("Failed to initialize SFTP session: {}", e))
        })?;

    Ok(Arc::new(SftpSession::new(sftp, target)))
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    auth: ResolvedAuth,
    hostname: &str,
    port: u16,
) -> Result<(), SshError> {
    let method_name = auth.method_name();
    security_log::log_auth_attempt(hostname, port, username, method_name);

    let result = match auth {
        // Use expose_secret() only at the point of authentication
        ResolvedAuth::Password(password) => {
            handle
                .authenticate_password(username, password.expose_secret())
                .await
        }
        ResolvedAuth::PublicKey(key) => handle.authenticate_publickey(username, key).await,
    };

    let auth_result = match result {
        Ok(result) => result,
        Err(e) => {
            let reason = e.to_string();
            security_log::log_auth_failure(hostname, port, username, method_name, &reason);
            return Err(SshError::AuthenticationFailed(reason));
        }
    };

    if !auth_result.success() {
        let reason = "Authentication rejected by server";
        security_log::log_auth_failure(hostname, port, username, method_name, reason);
        return Err(SshError::AuthenticationFailed(reason.to_string()));
    }

    security_log::log_auth_success(hostname, port, username, method_name);
    Ok(())
}

/// Creates [`SshConnection`]s from the application settings
pub struct RusshConnector {
    secrets: Arc<dyn SecretStore>,
    service: String,
    settings: SshSettings,
    policy: HostKeyPolicy,
}

impl RusshConnector {
    pub fn new(secrets: Arc<dyn SecretStore>, service: impl Into<String>, settings: SshSettings) -> Self {
        let policy = HostKeyPolicy::from_settings(&settings);
        Self {
            secrets,
            service: service.into(),
            settings,
            policy,
        }
    }
}

impl SshConnector for RusshConnector {
    fn connection(&self, server: &ServerConfig) -> Arc<dyn SshTransport> {
        Arc::new(SshConnection::new(
            server.clone(),
            self.secrets.clone(),
            self.service.clone(),
            self.settings.clone(),
            self.policy.clone(),
        ))
    }
}
