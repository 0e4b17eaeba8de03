//! Security event logging for audit trails.
//!
//! Provides structured logging functions for security-relevant events such as
//! authentication attempts, relaxed host key checks, tunnel and gateway
//! lifecycle, and remote filesystem mounts.
//!
//! All security events are logged with `target: "security"` to allow filtering
//! in production environments.
//!
//! # Example
//!
//! Filter security events only:
//! ```bash
//! RUST_LOG=security=info throttle-bridge
//! ```

use tracing::{info, warn};

/// Log an SSH authentication attempt.
///
/// Called before attempting to authenticate with a remote host.
pub fn log_auth_attempt(host: &str, port: u16, username: &str, method: &str) {
    info!(
        target: "security",
        event = "auth_attempt",
        host = %host,
        port = port,
        username = %username,
        method = %method,
        "SSH authentication attempt"
    );
}

/// Log a successful SSH authentication.
pub fn log_auth_success(host: &str, port: u16, username: &str, method: &str) {
    info!(
        target: "security",
        event = "auth_success",
        host = %host,
        port = port,
        username = %username,
        method = %method,
        "SSH authentication succeeded"
    );
}

/// Log a failed SSH authentication attempt.
pub fn log_auth_failure(host: &str, port: u16, username: &str, method: &str, reason: &str) {
    warn!(
        target: "security",
        event = "auth_failure",
        host = %host,
        port = port,
        username = %username,
        method = %method,
        reason = %reason,
        "SSH authentication failed"
    );
}

/// Log a host key accepted without verification.
///
/// Emitted on every connection made under the accept-any policy.
pub fn log_host_key_unverified(host: &str, port: u16, fingerprint: &str) {
    warn!(
        target: "security",
        event = "host_key_unverified",
        host = %host,
        port = port,
        fingerprint = %fingerprint,
        "Host key accepted WITHOUT verification - MITM protection disabled"
    );
}

/// Log a host key learned on first use.
pub fn log_host_key_learned(host: &str, port: u16, fingerprint: &str) {
    info!(
        target: "security",
        event = "host_key_learned",
        host = %host,
        port = port,
        fingerprint = %fingerprint,
        "New host key recorded"
    );
}

/// Log a host key that failed verification.
pub fn log_host_key_rejected(host: &str, port: u16, reason: &str) {
    warn!(
        target: "security",
        event = "host_key_rejected",
        host = %host,
        port = port,
        reason = %reason,
        "Host key rejected"
    );
}

/// Log an SFTP sub-session establishment.
pub fn log_sftp_connect(host: &str, port: u16, username: &str) {
    info!(
        target: "security",
        event = "sftp_connect",
        host = %host,
        port = port,
        username = %username,
        "SFTP session established"
    );
}

/// Log an SSH session teardown.
pub fn log_ssh_disconnect(host: &str, port: u16) {
    info!(
        target: "security",
        event = "ssh_disconnect",
        host = %host,
        port = port,
        "SSH connection closed"
    );
}

/// Log a local port forward opening.
pub fn log_tunnel_started(local_addr: &str, remote_host: &str, remote_port: u16) {
    info!(
        target: "security",
        event = "tunnel_started",
        local = %local_addr,
        remote_host = %remote_host,
        remote_port = remote_port,
        "Local port forward listening"
    );
}

/// Log a local port forward closing.
pub fn log_tunnel_stopped(local_addr: &str) {
    info!(
        target: "security",
        event = "tunnel_stopped",
        local = %local_addr,
        "Local port forward closed"
    );
}

/// Log the anonymous FTP gateway starting.
///
/// The gateway accepts any credentials, so its listen address is worth auditing.
pub fn log_gateway_started(local_addr: &str, host: &str) {
    warn!(
        target: "security",
        event = "ftp_gateway_started",
        local = %local_addr,
        backend = %host,
        "Anonymous FTP gateway listening"
    );
}

/// Log the FTP gateway stopping.
pub fn log_gateway_stopped(local_addr: &str) {
    info!(
        target: "security",
        event = "ftp_gateway_stopped",
        local = %local_addr,
        "FTP gateway stopped"
    );
}

/// Log a remote filesystem mount.
pub fn log_mount(key: &str, mount_path: &str, method: &str) {
    info!(
        target: "security",
        event = "mount",
        key = %key,
        path = %mount_path,
        method = %method,
        "Remote filesystem mounted"
    );
}

/// Log a remote filesystem unmount.
pub fn log_unmount(key: &str, forced: bool) {
    info!(
        target: "security",
        event = "unmount",
        key = %key,
        forced = forced,
        "Remote filesystem unmounted"
    );
}
