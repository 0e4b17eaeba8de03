use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Failed to create config directory: {0}")]
    CreateDir(std::io::Error),
}

/// Secret store errors
#[derive(Error, Debug, Clone)]
pub enum SecretError {
    #[error("Secret store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to access secret '{key}': {reason}")]
    Access { key: String, reason: String },
}

/// SSH-related errors
#[derive(Error, Debug)]
pub enum SshError {
    #[error("Invalid server configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Network unreachable for {host}:{port}: {reason}")]
    NetworkUnreachable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Timeout connecting to {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Cannot read credentials: {0}")]
    SecretStore(#[from] SecretError),

    #[error("Key error: {0}")]
    KeyFile(String),

    #[error("Private key for '{0}' is encrypted and no passphrase is stored")]
    KeyFilePassphraseRequired(String),

    #[error("Stored passphrase for '{0}' does not decrypt the private key")]
    KeyFilePassphraseInvalid(String),

    #[error("Host key verification failed: {0}")]
    HostKeyVerification(String),

    #[error("SSH connection is not open")]
    NotConnected,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("russh error: {0}")]
    Russh(String),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Russh(err.to_string())
    }
}

/// SFTP-related errors
#[derive(Error, Debug)]
pub enum SftpError {
    #[error("SFTP connection failed: {0}")]
    ConnectionFailed(String),

    #[error("File operation failed: {0}")]
    FileOperation(String),
}

impl From<SshError> for SftpError {
    fn from(err: SshError) -> Self {
        SftpError::ConnectionFailed(err.to_string())
    }
}

/// Local port-forward tunnel errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Tunnel is already connected")]
    AlreadyConnected,

    #[error("Tunnel connection failed: {0}")]
    ConnectionFailed(#[source] SshError),

    #[error("Tunnel connection failed: cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Tunnel shutdown error: {0}")]
    Shutdown(String),
}

/// FTP gateway lifecycle errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway SSH connection failed: {0}")]
    Connection(#[from] SshError),

    #[error("Gateway SFTP session failed: {0}")]
    Sftp(#[from] SftpError),

    #[error("Gateway cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// Errors inside a single FTP control session
#[derive(Error, Debug)]
pub enum FtpError {
    #[error("Invalid PORT command")]
    InvalidPort,

    #[error("No data connection established")]
    NoDataConnection,

    #[error("Data connection failed: {0}")]
    DataConnection(String),

    #[error("Control connection error: {0}")]
    Control(#[from] std::io::Error),
}

/// Remote filesystem mount errors.
///
/// Cloneable so callers waiting on an in-flight mount get the same outcome.
#[derive(Error, Debug, Clone)]
pub enum MountError {
    #[error("Invalid server configuration for mount: {0}")]
    InvalidServerConfiguration(String),

    #[error("Missing credentials for mount of '{0}'")]
    MissingCredentials(String),

    #[error("Cannot read credentials for mount of '{server}': {source}")]
    SecretStore {
        server: String,
        source: SecretError,
    },

    #[error("Failed to create mount directory {path}: {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        source: Arc<std::io::Error>,
    },

    #[error("Failed to stage private key: {0}")]
    KeyStagingFailed(String),

    #[error("Mount process failed for {key}: {reason}")]
    MountProcessFailed { key: String, reason: String },

    #[error("Unmount failed for {key}: {reason}")]
    UnmountFailed { key: String, reason: String },
}
