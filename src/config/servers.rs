use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::ConfigError;

/// How the SSH side of a server authenticates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Password read from the secret store
    #[default]
    Password,
    /// Private key (optionally passphrase-protected) read from the secret store
    Key,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Password => "password",
            AuthMode::Key => "publickey",
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_rpc_port() -> u16 {
    9091
}

fn default_rpc_path() -> String {
    "/transmission/rpc".to_string()
}

/// One Transmission remote and the SSH endpoint in front of it.
///
/// `name` doubles as the suffix of the secret store keys, so renaming a
/// server orphans its stored credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    /// Remote base path used for mounts and as the FTP gateway's root context
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub auth: AuthMode,
    /// Forward the Transmission RPC port through SSH
    #[serde(default)]
    pub rpc_tunnel: bool,
    /// Expose remote files through the FTP gateway and an sshfs mount
    #[serde(default)]
    pub browse: bool,
    /// Transmission runs on this machine; no tunnel or gateway is needed
    #[serde(default)]
    pub use_local_daemon: bool,
    /// Host serving RPC when it is not tunnelled; falls back to `host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_host: Option<String>,
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    #[serde(default = "default_rpc_path")]
    pub rpc_path: String,
    #[serde(default)]
    pub rpc_tls: bool,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            is_default: false,
            host: host.into(),
            port: default_port(),
            user: user.into(),
            path: String::new(),
            auth: AuthMode::default(),
            rpc_tunnel: false,
            browse: false,
            use_local_daemon: false,
            rpc_host: None,
            rpc_port: default_rpc_port(),
            rpc_path: default_rpc_path(),
            rpc_tls: false,
        }
    }

    /// Check that the fields an SSH handshake needs are present.
    ///
    /// Returns the name of the first missing field.
    pub fn validate_ssh(&self) -> Result<(), &'static str> {
        if self.host.trim().is_empty() {
            return Err("host");
        }
        if self.user.trim().is_empty() {
            return Err("user");
        }
        if self.port == 0 {
            return Err("port");
        }
        Ok(())
    }

    /// Host used for direct (untunnelled) RPC.
    pub fn rpc_host(&self) -> &str {
        self.rpc_host.as_deref().unwrap_or(&self.host)
    }
}

/// Root of servers.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServersConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl ServersConfig {
    /// Find a server by display name
    pub fn find(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Find a server by display name or fail with `ServerNotFound`
    pub fn require(&self, name: &str) -> Result<&ServerConfig, ConfigError> {
        self.find(name)
            .ok_or_else(|| ConfigError::ServerNotFound(name.to_string()))
    }

    /// The server flagged as default, else the first one
    pub fn default_server(&self) -> Option<&ServerConfig> {
        self.servers
            .iter()
            .find(|s| s.is_default)
            .or_else(|| self.servers.first())
    }

    /// Load from the standard location, returning an empty list if absent
    pub fn load() -> Result<Self, ConfigError> {
        let path = servers_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        tracing::debug!("Loading servers from: {:?}", path);

        if !path.exists() {
            tracing::warn!("Servers file does not exist: {:?}", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save to the standard location
    pub fn save(&self) -> Result<(), ConfigError> {
        super::paths::ensure_config_dir().map_err(ConfigError::CreateDir)?;
        let path = servers_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        super::write_atomic(path, &content).map_err(|e| ConfigError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

fn servers_path() -> Result<PathBuf, ConfigError> {
    super::paths::servers_file().ok_or_else(|| ConfigError::ReadFile {
        path: PathBuf::from("servers.toml"),
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine servers file path",
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_entry_gets_defaults() {
        let parsed: ServersConfig = toml::from_str(
            r#"
            [[servers]]
            name = "seedbox"
            host = "seed.example.com"
            user = "alice"
            "#,
        )
        .expect("parse");

        let server = &parsed.servers[0];
        assert_eq!(server.port, 22);
        assert_eq!(server.rpc_port, 9091);
        assert_eq!(server.rpc_path, "/transmission/rpc");
        assert_eq!(server.auth, AuthMode::Password);
        assert!(!server.browse);
        assert_eq!(server.rpc_host(), "seed.example.com");
    }

    #[test]
    fn auth_mode_parses_snake_case() {
        let parsed: ServersConfig = toml::from_str(
            r#"
            [[servers]]
            name = "box"
            host = "h"
            user = "u"
            auth = "key"
            browse = true
            "#,
        )
        .expect("parse");
        assert_eq!(parsed.servers[0].auth, AuthMode::Key);
        assert!(parsed.servers[0].browse);
    }

    #[test]
    fn validate_ssh_names_missing_field() {
        let mut server = ServerConfig::new("box", "", "u");
        assert_eq!(server.validate_ssh(), Err("host"));

        server.host = "h".into();
        server.user = "  ".into();
        assert_eq!(server.validate_ssh(), Err("user"));

        server.user = "u".into();
        server.port = 0;
        assert_eq!(server.validate_ssh(), Err("port"));

        server.port = 2222;
        assert!(server.validate_ssh().is_ok());
    }

    #[test]
    fn default_server_prefers_flag_then_first() {
        let mut config = ServersConfig::default();
        assert!(config.default_server().is_none());

        config.servers.push(ServerConfig::new("a", "h", "u"));
        config.servers.push(ServerConfig::new("b", "h", "u"));
        assert_eq!(config.default_server().map(|s| s.name.as_str()), Some("a"));

        config.servers[1].is_default = true;
        assert_eq!(config.default_server().map(|s| s.name.as_str()), Some("b"));
    }

    #[test]
    fn require_reports_missing_server() {
        let config = ServersConfig::default();
        let err = config.require("ghost").unwrap_err();
        assert!(matches!(err, ConfigError::ServerNotFound(name) if name == "ghost"));
    }

    #[test]
    fn save_then_load_preserves_entries() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("servers.toml");

        let mut server = ServerConfig::new("box", "h", "u");
        server.path = "/srv/media".into();
        server.rpc_tunnel = true;
        let config = ServersConfig {
            servers: vec![server.clone()],
        };
        config.save_to(&path).expect("save");

        let loaded = ServersConfig::load_from(&path).expect("load");
        assert_eq!(loaded.servers, vec![server]);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("temp dir");
        let loaded = ServersConfig::load_from(&dir.path().join("nope.toml")).expect("load");
        assert!(loaded.servers.is_empty());
    }
}
