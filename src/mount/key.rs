use std::io::Write;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};

use crate::config::paths;
use crate::error::MountError;

/// Directory under the mount root holding staged private keys
pub const KEYS_DIR: &str = ".keys";

/// Deterministic identity of one host + remote path.
///
/// The host is lower-cased, so `Example.com` and `example.com` share a key.
/// Leading and trailing slashes of the path are ignored and inner slashes
/// become `:`. A path that trims to nothing maps to `root`.
pub fn mount_key(host: &str, path: &str) -> String {
    let host = host.trim().to_lowercase();
    let path = path.trim().trim_matches('/');
    let path = if path.is_empty() {
        "root".to_string()
    } else {
        path.replace('/', ":")
    };
    format!("{}:{}", host, path)
}

/// Local directory a key is mounted on
pub fn mount_path(mount_root: &Path, key: &str) -> PathBuf {
    mount_root.join(key)
}

/// Write a private key to an owner-only file for sshfs `IdentityFile`.
///
/// The file gets a random name so concurrent mounts never share one.
pub fn stage_private_key(mount_root: &Path, key: &SecretString) -> Result<PathBuf, MountError> {
    let dir = mount_root.join(KEYS_DIR);
    paths::ensure_private_dir(&dir)
        .map_err(|e| MountError::KeyStagingFailed(format!("{}: {}", dir.display(), e)))?;

    let path = dir.join(format!("sshfs_key_{}", uuid::Uuid::new_v4()));
    write_owner_only(&path, key.expose_secret())
        .map_err(|e| MountError::KeyStagingFailed(format!("{}: {}", path.display(), e)))?;
    Ok(path)
}

fn write_owner_only(path: &Path, content: &str) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(content.as_bytes())?;
    // OpenSSH refuses keys without a final newline
    if !content.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.sync_all()
}

/// Best-effort removal of a staged key
pub fn remove_staged_key(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove staged key {}: {}", path.display(), e);
        }
    }
}
