//! Application-level orchestration of tunnels, gateways and mounts for the
//! selected server.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{AppConfig, ServerConfig};
use crate::ftp::{FtpGateway, FtpGatewayRegistry, GATEWAY_KEY};
use crate::mount::{CommandRunner, MountLifecycleManager};
use crate::ssh::{HostKeyPolicy, SshConnector};
use crate::tunnel::{RPC_TUNNEL_KEY, TunnelConfig, TunnelManager, TunnelRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Warning,
    Error,
}

/// Where user-facing status messages go
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NotifyLevel, message: &str);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: NotifyLevel, message: &str) {
        match level {
            NotifyLevel::Info => info!(target: "notify", "{}", message),
            NotifyLevel::Warning => warn!(target: "notify", "{}", message),
            NotifyLevel::Error => error!(target: "notify", "{}", message),
        }
    }
}

/// Outcome of one feature after a selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FeatureState {
    #[default]
    Disabled,
    Active,
    Failed(String),
}

impl FeatureState {
    pub fn is_active(&self) -> bool {
        *self == FeatureState::Active
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub tunnel: FeatureState,
    pub gateway: FeatureState,
    pub mount: FeatureState,
}

pub struct Bridge {
    config: AppConfig,
    connector: Arc<dyn SshConnector>,
    notifier: Arc<dyn Notifier>,
    tunnels: TunnelRegistry,
    gateways: FtpGatewayRegistry,
    mounts: MountLifecycleManager,
    current: Mutex<Option<ServerConfig>>,
}

impl Bridge {
    pub fn new(
        config: AppConfig,
        secrets: Arc<dyn crate::secrets::SecretStore>,
        connector: Arc<dyn SshConnector>,
        runner: Arc<dyn CommandRunner>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let mounts = MountLifecycleManager::new(
            config.mount.clone(),
            HostKeyPolicy::from_settings(&config.ssh),
            secrets,
            config.secrets.service.clone(),
            runner,
        );
        Self {
            config,
            connector,
            notifier,
            tunnels: TunnelRegistry::new(),
            gateways: FtpGatewayRegistry::new(),
            mounts,
            current: Mutex::new(None),
        }
    }

    pub fn tunnels(&self) -> &TunnelRegistry {
        &self.tunnels
    }

    pub fn gateways(&self) -> &FtpGatewayRegistry {
        &self.gateways
    }

    pub fn mounts(&self) -> &MountLifecycleManager {
        &self.mounts
    }

    pub async fn current_server(&self) -> Option<ServerConfig> {
        self.current.lock().await.clone()
    }

    /// Make `server` the active one, replacing whatever ran for the previous
    /// selection.
    pub async fn select_server(&self, server: ServerConfig) -> Selection {
        let mut current = self.current.lock().await;

        if let Some(previous) = current.as_ref() {
            if MountLifecycleManager::mount_key(previous) != MountLifecycleManager::mount_key(&server) {
                if let Err(e) = self.mounts.unmount(previous).await {
                    warn!("Unmounting previous server '{}': {}", previous.name, e);
                }
            }
        }

        *current = Some(server.clone());
        self.activate(&server).await
    }

    async fn activate(&self, server: &ServerConfig) -> Selection {
        self.tear_down_network().await;

        let mut selection = Selection::default();
        if server.use_local_daemon {
            info!("'{}' uses a local daemon; nothing to forward", server.name);
            return selection;
        }

        if server.rpc_tunnel {
            selection.tunnel = self.start_tunnel(server).await;
        }
        if server.browse {
            selection.gateway = self.start_gateway(server).await;
            selection.mount = match self.mounts.mount(server).await {
                Ok(_) => FeatureState::Active,
                Err(e) => {
                    self.notifier
                        .notify(NotifyLevel::Error, &format!("Mount of '{}' failed: {}", server.name, e));
                    FeatureState::Failed(e.to_string())
                }
            };
        }
        selection
    }

    async fn start_tunnel(&self, server: &ServerConfig) -> FeatureState {
        let settings = &self.config.tunnel;
        let policy = settings.retry;
        let attempts = policy.max_attempts.max(1);

        let result = policy
            .run(|attempt| async move {
                let tunnel = Arc::new(TunnelManager::new(
                    self.connector.connection(server),
                    TunnelConfig::new(settings.local_port, settings.remote_host.clone(), server.rpc_port)
                        .with_buffer_size(settings.relay_buffer_size),
                ));
                match tunnel.start().await {
                    Ok(()) => {
                        self.tunnels.store(RPC_TUNNEL_KEY, tunnel).await;
                        Ok(())
                    }
                    Err(e) => {
                        let _ = self.tunnels.remove(RPC_TUNNEL_KEY).await;
                        self.tunnels.tear_down_all().await;
                        if attempt + 1 < attempts {
                            self.notifier.notify(
                                NotifyLevel::Warning,
                                &format!("Tunnel attempt {} of {} failed: {}", attempt + 1, attempts, e),
                            );
                        }
                        Err(e)
                    }
                }
            })
            .await;

        match result {
            Ok(()) => {
                self.notifier.notify(NotifyLevel::Info, &format!("Tunnel to '{}' is up", server.name));
                FeatureState::Active
            }
            Err(e) => {
                self.notifier.notify(
                    NotifyLevel::Error,
                    &format!("Tunnel to '{}' failed after {} attempts: {}", server.name, attempts, e),
                );
                FeatureState::Failed(e.to_string())
            }
        }
    }

    async fn start_gateway(&self, server: &ServerConfig) -> FeatureState {
        let settings = &self.config.gateway;
        let policy = settings.retry;
        let attempts = policy.max_attempts.max(1);

        let result = policy
            .run(|attempt| async move {
                let gateway = Arc::new(FtpGateway::from_settings(self.connector.connection(server), settings));
                match gateway.start().await {
                    Ok(()) => {
                        self.gateways.store(GATEWAY_KEY, gateway).await;
                        Ok(())
                    }
                    Err(e) => {
                        let _ = gateway.stop().await;
                        if attempt + 1 < attempts {
                            self.notifier.notify(
                                NotifyLevel::Warning,
                                &format!("File server attempt {} of {} failed: {}", attempt + 1, attempts, e),
                            );
                        }
                        Err(e)
                    }
                }
            })
            .await;

        match result {
            Ok(()) => FeatureState::Active,
            Err(e) => {
                self.notifier.notify(
                    NotifyLevel::Error,
                    &format!("File server for '{}' failed after {} attempts: {}", server.name, attempts, e),
                );
                FeatureState::Failed(e.to_string())
            }
        }
    }

    async fn tear_down_network(&self) {
        for (key, e) in self.tunnels.tear_down_all().await {
            warn!("Tunnel '{}' did not stop cleanly: {}", key, e);
        }
        for (key, e) in self.gateways.tear_down_all().await {
            warn!("Gateway '{}' did not stop cleanly: {}", key, e);
        }
    }

    /// URL for Transmission RPC: the local tunnel when one is running,
    /// otherwise the server directly. Never carries credentials.
    pub async fn rpc_endpoint(&self) -> Option<String> {
        let server = self.current.lock().await.clone()?;

        if let Some(tunnel) = self.tunnels.get(RPC_TUNNEL_KEY).await {
            if let Some(addr) = tunnel.local_addr().filter(|_| tunnel.is_running()) {
                return Some(format!("http://127.0.0.1:{}{}", addr.port(), server.rpc_path));
            }
        }

        let scheme = if server.rpc_tls { "https" } else { "http" };
        Some(format!(
            "{}://{}:{}{}",
            scheme,
            server.rpc_host(),
            server.rpc_port,
            server.rpc_path
        ))
    }

    /// Local address of the FTP gateway, when one is running
    pub async fn gateway_addr(&self) -> Option<std::net::SocketAddr> {
        self.gateways.get(GATEWAY_KEY).await?.local_addr()
    }

    /// Release network listeners while the app is not in front.
    /// Mounts stay.
    pub async fn enter_background(&self) {
        let _current = self.current.lock().await;
        info!("Entering background; stopping tunnels and gateways");
        self.tear_down_network().await;
    }

    pub async fn enter_foreground(&self) -> Option<Selection> {
        self.reactivate("foreground").await
    }

    pub async fn network_changed(&self) -> Option<Selection> {
        self.reactivate("network change").await
    }

    async fn reactivate(&self, reason: &str) -> Option<Selection> {
        let current = self.current.lock().await;
        let server = current.as_ref()?;
        info!("Restarting services for '{}' after {}", server.name, reason);
        Some(self.activate(server).await)
    }

    /// Stop everything, including mounts, and forget the selection
    pub async fn shutdown(&self) {
        let mut current = self.current.lock().await;
        self.tear_down_network().await;
        for (key, e) in self.mounts.unmount_all().await {
            warn!("Unmount of {} failed during shutdown: {}", key, e);
        }
        *current = None;
        info!("Bridge shut down");
    }
}
