use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GatewaySettings;
use crate::error::GatewayError;
use crate::registry::Stoppable;
use crate::security_log;
use crate::sftp::RemoteFs;
use crate::ssh::SshTransport;

use super::session::FtpSession;

/// Snapshot of a gateway for status display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStatus {
    pub is_running: bool,
    pub status: String,
    pub connection_count: usize,
}

impl GatewayStatus {
    fn stopped() -> Self {
        Self {
            is_running: false,
            status: "Stopped".to_string(),
            connection_count: 0,
        }
    }
}

type ClientMap = Arc<parking_lot::Mutex<HashMap<Uuid, JoinHandle<()>>>>;

struct RunningGateway {
    local_addr: SocketAddr,
    fs: Arc<dyn RemoteFs>,
    stop_tx: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

/// Anonymous FTP server on 127.0.0.1 whose files live behind SFTP.
///
/// All clients share the connection's single SFTP sub-session.
pub struct FtpGateway {
    connection: Arc<dyn SshTransport>,
    local_port: u16,
    data_timeout: Duration,
    status: Arc<watch::Sender<GatewayStatus>>,
    lifecycle: tokio::sync::Mutex<Option<RunningGateway>>,
    bound: parking_lot::Mutex<Option<SocketAddr>>,
    clients: ClientMap,
}

impl FtpGateway {
    pub fn new(connection: Arc<dyn SshTransport>, local_port: u16, data_timeout: Duration) -> Self {
        let (status, _) = watch::channel(GatewayStatus::stopped());
        Self {
            connection,
            local_port,
            data_timeout,
            status: Arc::new(status),
            lifecycle: tokio::sync::Mutex::new(None),
            bound: parking_lot::Mutex::new(None),
            clients: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    pub fn from_settings(connection: Arc<dyn SshTransport>, settings: &GatewaySettings) -> Self {
        Self::new(connection, settings.local_port, settings.data_connect_timeout())
    }

    pub fn status(&self) -> GatewayStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GatewayStatus> {
        self.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.status.borrow().is_running
    }

    pub fn connection_count(&self) -> usize {
        self.status.borrow().connection_count
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    /// Connect, open SFTP, bind the control listener and start serving.
    /// A no-op while already running.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            debug!("FTP gateway already running");
            return Ok(());
        }

        self.status.send_replace(GatewayStatus {
            is_running: false,
            status: "Starting...".to_string(),
            connection_count: 0,
        });

        let running = match self.open().await {
            Ok(running) => running,
            Err(e) => {
                error!("FTP gateway failed to start: {}", e);
                self.connection.close().await;
                self.status.send_replace(GatewayStatus {
                    is_running: false,
                    status: format!("Failed: {}", e),
                    connection_count: 0,
                });
                return Err(e);
            }
        };

        let local_addr = running.local_addr;
        *self.bound.lock() = Some(local_addr);
        *lifecycle = Some(running);

        self.status.send_replace(GatewayStatus {
            is_running: true,
            status: format!("Running on localhost:{}", local_addr.port()),
            connection_count: 0,
        });
        security_log::log_gateway_started(&local_addr.to_string(), &self.connection.target());
        info!("FTP gateway listening on {} for {}", local_addr, self.connection.target());
        Ok(())
    }

    async fn open(&self) -> Result<RunningGateway, GatewayError> {
        self.connection.connect().await?;
        let fs = self.connection.open_sftp().await?;

        let addr = format!("127.0.0.1:{}", self.local_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| GatewayError::Bind { addr: addr.clone(), source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| GatewayError::Bind { addr, source })?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            fs.clone(),
            self.data_timeout,
            self.clients.clone(),
            self.status.clone(),
            local_addr.port(),
            stop_rx,
        ));

        Ok(RunningGateway {
            local_addr,
            fs,
            stop_tx,
            accept_task,
        })
    }

    /// Stop accepting, end every client session, close SFTP and disconnect.
    /// Idempotent.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        // A start still connecting holds the lifecycle lock; closing the
        // transport makes it fail fast instead of waiting out the handshake
        let mut lifecycle = match self.lifecycle.try_lock() {
            Ok(lifecycle) => lifecycle,
            Err(_) => {
                self.connection.close().await;
                self.lifecycle.lock().await
            }
        };
        let mut result = Ok(());

        if let Some(running) = lifecycle.take() {
            let _ = running.stop_tx.send(());
            if let Err(e) = running.accept_task.await {
                if !e.is_cancelled() {
                    warn!("FTP accept loop ended abnormally: {}", e);
                }
            }

            let clients: Vec<_> = self.clients.lock().drain().map(|(_, handle)| handle).collect();
            for handle in &clients {
                handle.abort();
            }
            for handle in clients {
                let _ = handle.await;
            }

            if let Err(e) = running.fs.close().await {
                debug!("SFTP close during gateway stop: {}", e);
                result = Err(e.into());
            }
            security_log::log_gateway_stopped(&running.local_addr.to_string());
            info!("FTP gateway on {} stopped", running.local_addr);
        }

        self.connection.close().await;
        *self.bound.lock() = None;
        self.status.send_replace(GatewayStatus::stopped());
        result
    }
}

#[async_trait]
impl Stoppable for FtpGateway {
    type Error = GatewayError;

    async fn stop(&self) -> Result<(), GatewayError> {
        FtpGateway::stop(self).await
    }
}

fn publish_count(status: &watch::Sender<GatewayStatus>, port: u16, count: usize) {
    status.send_if_modified(|current| {
        if !current.is_running || current.connection_count == count {
            return false;
        }
        current.connection_count = count;
        current.status = if count == 0 {
            format!("Running on localhost:{}", port)
        } else {
            format!("Active: {} connection(s)", count)
        };
        true
    });
}

async fn accept_loop(
    listener: TcpListener,
    fs: Arc<dyn RemoteFs>,
    data_timeout: Duration,
    clients: ClientMap,
    status: Arc<watch::Sender<GatewayStatus>>,
    port: u16,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("FTP client connected from {}", peer_addr);
                    let id = Uuid::new_v4();
                    let session = FtpSession::new(stream, fs.clone(), data_timeout);
                    let task_clients = clients.clone();
                    let task_status = status.clone();

                    // Registered under the lock so the task cannot deregister first
                    let mut map = clients.lock();
                    let handle = tokio::spawn(async move {
                        if let Err(e) = session.run().await {
                            debug!("FTP session {} ended: {}", peer_addr, e);
                        }
                        let count = {
                            let mut map = task_clients.lock();
                            map.remove(&id);
                            map.len()
                        };
                        publish_count(&task_status, port, count);
                    });
                    map.insert(id, handle);
                    let count = map.len();
                    drop(map);
                    publish_count(&status, port, count);
                }
                Err(e) => {
                    warn!("FTP accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("FTP accept loop on port {} exited", port);
}
