use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Application-wide settings stored in config.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub secrets: SecretsSettings,
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub mount: MountSettings,
}

impl AppConfig {
    /// Load from file, creating default if not exists
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path()?;

        if !path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save to file
    pub fn save(&self) -> Result<(), ConfigError> {
        super::paths::ensure_config_dir().map_err(ConfigError::CreateDir)?;
        let path = config_path()?;
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        super::write_atomic(&path, &content).map_err(|e| ConfigError::WriteFile { path, source: e })
    }
}

fn config_path() -> Result<PathBuf, ConfigError> {
    super::paths::config_file().ok_or_else(|| ConfigError::ReadFile {
        path: PathBuf::from("config.toml"),
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine config file path",
        ),
    })
}

/// How SSH host keys are checked, as written in config.toml
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicyKind {
    /// Accept any key. Matches the sshfs `StrictHostKeyChecking=no` posture.
    AcceptAny,
    /// Only keys already present in the known_hosts file
    KnownHosts,
    /// Learn unknown keys, reject changed ones
    #[default]
    TrustFirstUse,
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshSettings {
    #[serde(default = "default_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
    /// Unanswered keepalives before the session is considered dead
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicyKind,
    /// Overrides the application's own known_hosts file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_timeout(),
            keepalive_interval_secs: default_keepalive(),
            keepalive_max: default_keepalive_max(),
            host_key_policy: HostKeyPolicyKind::default(),
            known_hosts_path: None,
        }
    }
}

impl SshSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Resolved known_hosts path: explicit setting, else the config dir copy.
    pub fn known_hosts_file(&self) -> Option<PathBuf> {
        match &self.known_hosts_path {
            Some(p) => Some(super::paths::expand_tilde(p)),
            None => super::paths::known_hosts_file(),
        }
    }
}

fn default_service() -> String {
    "throttle-bridge".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecretsSettings {
    /// Keychain service name credentials are scoped under
    #[serde(default = "default_service")]
    pub service: String,
}

impl Default for SecretsSettings {
    fn default() -> Self {
        Self {
            service: default_service(),
        }
    }
}

fn default_tunnel_port() -> u16 {
    4000
}

fn default_remote_host() -> String {
    "127.0.0.1".to_string()
}

fn default_relay_buffer() -> usize {
    32 * 1024
}

fn default_tunnel_retry() -> RetryPolicy {
    RetryPolicy::fixed(3, Duration::from_secs(2))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelSettings {
    #[serde(default = "default_tunnel_port")]
    pub local_port: u16,
    /// Target host as seen from the SSH server
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    #[serde(default = "default_relay_buffer")]
    pub relay_buffer_size: usize,
    #[serde(default = "default_tunnel_retry")]
    pub retry: RetryPolicy,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            local_port: default_tunnel_port(),
            remote_host: default_remote_host(),
            relay_buffer_size: default_relay_buffer(),
            retry: default_tunnel_retry(),
        }
    }
}

fn default_gateway_port() -> u16 {
    2121
}

fn default_data_timeout() -> u64 {
    30
}

fn default_gateway_retry() -> RetryPolicy {
    RetryPolicy::fixed(4, Duration::from_secs(2))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_port")]
    pub local_port: u16,
    #[serde(default = "default_data_timeout")]
    pub data_connect_timeout_secs: u64,
    #[serde(default = "default_gateway_retry")]
    pub retry: RetryPolicy,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            local_port: default_gateway_port(),
            data_connect_timeout_secs: default_data_timeout(),
            retry: default_gateway_retry(),
        }
    }
}

impl GatewaySettings {
    pub fn data_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.data_connect_timeout_secs)
    }
}

fn default_sshfs() -> String {
    "sshfs".to_string()
}

fn default_umount() -> String {
    "umount".to_string()
}

fn default_force_unmount() -> Vec<String> {
    if cfg!(target_os = "macos") {
        vec!["diskutil".into(), "unmount".into(), "force".into()]
    } else {
        vec!["umount".into(), "-f".into()]
    }
}

fn default_health_probe() -> String {
    "df".to_string()
}

fn default_alive_interval() -> u32 {
    30
}

fn default_alive_count() -> u32 {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MountSettings {
    /// Directory holding one mount point per mount key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_root: Option<PathBuf>,
    #[serde(default = "default_sshfs")]
    pub sshfs_program: String,
    #[serde(default = "default_umount")]
    pub unmount_program: String,
    /// Program and leading arguments of the forced unmount; the mount path is appended
    #[serde(default = "default_force_unmount")]
    pub force_unmount: Vec<String>,
    #[serde(default = "default_health_probe")]
    pub health_probe_program: String,
    #[serde(default)]
    pub compression: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    #[serde(default = "default_alive_interval")]
    pub server_alive_interval: u32,
    #[serde(default = "default_alive_count")]
    pub server_alive_count_max: u32,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            mount_root: None,
            sshfs_program: default_sshfs(),
            unmount_program: default_umount(),
            force_unmount: default_force_unmount(),
            health_probe_program: default_health_probe(),
            compression: false,
            cipher: None,
            server_alive_interval: default_alive_interval(),
            server_alive_count_max: default_alive_count(),
        }
    }
}

impl MountSettings {
    pub fn mount_root(&self) -> PathBuf {
        self.mount_root
            .clone()
            .unwrap_or_else(super::paths::default_mount_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: AppConfig = toml::from_str("").expect("parse");
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.tunnel.local_port, 4000);
        assert_eq!(config.gateway.local_port, 2121);
        assert_eq!(config.gateway.retry.max_attempts, 4);
        assert_eq!(config.tunnel.retry.max_attempts, 3);
        assert_eq!(config.tunnel.relay_buffer_size, 32 * 1024);
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicyKind::TrustFirstUse);
        assert_eq!(config.secrets.service, "throttle-bridge");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [ssh]
            host_key_policy = "accept_any"

            [mount]
            compression = true
            cipher = "aes128-ctr"
            "#,
        )
        .expect("parse");

        assert_eq!(config.ssh.host_key_policy, HostKeyPolicyKind::AcceptAny);
        assert_eq!(config.ssh.keepalive_interval_secs, 30);
        assert!(config.mount.compression);
        assert_eq!(config.mount.cipher.as_deref(), Some("aes128-ctr"));
        assert_eq!(config.mount.sshfs_program, "sshfs");
    }

    #[test]
    fn retry_policy_round_trips_through_toml() {
        let mut config = AppConfig::default();
        config.gateway.retry = RetryPolicy::new(500, 8000, 6);

        let text = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.gateway.retry, RetryPolicy::new(500, 8000, 6));
    }

    #[test]
    fn explicit_mount_root_wins() {
        let settings = MountSettings {
            mount_root: Some(PathBuf::from("/mnt/throttle")),
            ..Default::default()
        };
        assert_eq!(settings.mount_root(), PathBuf::from("/mnt/throttle"));
        assert_eq!(
            MountSettings::default().mount_root(),
            super::super::paths::default_mount_root()
        );
    }
}
