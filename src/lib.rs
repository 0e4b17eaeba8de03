//! Throttle bridge library
//!
//! SSH plumbing for a Transmission remote: a local port forward to the RPC
//! endpoint, an anonymous FTP gateway over SFTP for media players, and
//! sshfs mounts of the download directory.

pub mod bridge;
pub mod config;
pub mod error;
pub mod ftp;
pub mod logging;
pub mod mount;
pub mod registry;
pub mod relay;
pub mod retry;
pub mod secrets;
pub mod sftp;
pub mod ssh;
pub mod tunnel;

pub(crate) mod security_log;
