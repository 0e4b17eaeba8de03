use std::future::Future;
use std::path::{Path, PathBuf};

use russh::ChannelId;
use russh::client::{Handler, Session};
use russh::keys::{HashAlg, PublicKey};

use crate::config::paths;
use crate::config::{HostKeyPolicyKind, SshSettings};
use crate::error::SshError;
use crate::security_log;

/// How server host keys are checked.
///
/// Shared by the russh handler and the sshfs option builder so a tunnel,
/// the gateway and a mount to the same server see one policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any key. Every connection logs a `security` warning.
    AcceptAny,
    /// Accept only keys already recorded in `path`
    KnownHosts { path: PathBuf },
    /// Record unknown keys in `path`, reject keys that changed
    TrustFirstUse { path: PathBuf },
}

impl HostKeyPolicy {
    pub fn from_settings(settings: &SshSettings) -> Self {
        let path = settings
            .known_hosts_file()
            .unwrap_or_else(|| paths::expand_tilde("~/.ssh/known_hosts"));
        match settings.host_key_policy {
            HostKeyPolicyKind::AcceptAny => HostKeyPolicy::AcceptAny,
            HostKeyPolicyKind::KnownHosts => HostKeyPolicy::KnownHosts { path },
            HostKeyPolicyKind::TrustFirstUse => HostKeyPolicy::TrustFirstUse { path },
        }
    }

    pub fn known_hosts_path(&self) -> Option<&Path> {
        match self {
            HostKeyPolicy::AcceptAny => None,
            HostKeyPolicy::KnownHosts { path } | HostKeyPolicy::TrustFirstUse { path } => {
                Some(path)
            }
        }
    }

    /// Check `key` for `host:port`. Blocking: touches the known_hosts file.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool, SshError> {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();

        match self {
            HostKeyPolicy::AcceptAny => {
                security_log::log_host_key_unverified(host, port, &fingerprint);
                Ok(true)
            }
            HostKeyPolicy::KnownHosts { path } => {
                match russh::keys::known_hosts::check_known_hosts_path(host, port, key, path) {
                    Ok(true) => {
                        tracing::debug!("Host key verified for {}:{}", host, port);
                        Ok(true)
                    }
                    Ok(false) => {
                        let reason = format!("unknown host key {}", fingerprint);
                        security_log::log_host_key_rejected(host, port, &reason);
                        Err(SshError::HostKeyVerification(format!(
                            "{} for {}:{} is not in {}",
                            reason,
                            host,
                            port,
                            path.display()
                        )))
                    }
                    Err(e) => Err(changed_key(host, port, &e)),
                }
            }
            HostKeyPolicy::TrustFirstUse { path } => {
                match russh::keys::known_hosts::check_known_hosts_path(host, port, key, path) {
                    Ok(true) => {
                        tracing::debug!("Host key verified for {}:{}", host, port);
                        Ok(true)
                    }
                    Ok(false) => {
                        if let Some(parent) = path.parent() {
                            paths::ensure_private_dir(parent).map_err(|e| {
                                SshError::HostKeyVerification(format!(
                                    "Cannot create {}: {}",
                                    parent.display(),
                                    e
                                ))
                            })?;
                        }
                        russh::keys::known_hosts::learn_known_hosts_path(host, port, key, path)
                            .map_err(|e| {
                                SshError::HostKeyVerification(format!(
                                    "Failed to write known_hosts {}: {}",
                                    path.display(),
                                    e
                                ))
                            })?;
                        security_log::log_host_key_learned(host, port, &fingerprint);
                        Ok(true)
                    }
                    Err(e) => Err(changed_key(host, port, &e)),
                }
            }
        }
    }
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        Self::from_settings(&SshSettings::default())
    }
}

fn changed_key(host: &str, port: u16, err: &russh::keys::Error) -> SshError {
    let reason = format!("host key mismatch: {}", err);
    security_log::log_host_key_rejected(host, port, &reason);
    SshError::HostKeyVerification(format!("{} for {}:{}", reason, host, port))
}

/// SSH client handler implementation
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }
}

impl Handler for ClientHandler {
    type Error = SshError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let host = self.host.clone();
        let port = self.port;
        let policy = self.policy.clone();
        let key = server_public_key.clone();

        async move {
            tokio::task::spawn_blocking(move || policy.verify(&host, port, &key))
                .await
                .map_err(|e| {
                    SshError::HostKeyVerification(format!("Host key check failed: {}", e))
                })?
        }
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}
