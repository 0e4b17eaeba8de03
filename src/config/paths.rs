use directories::ProjectDirs;
use std::path::PathBuf;

const LOG_DIR_ENV: &str = "THROTTLE_BRIDGE_LOG_DIR";

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "throttle", "throttle-bridge")
        .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
}

/// Get the path to the application settings file
pub fn config_file() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the server list file
pub fn servers_file() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("servers.toml"))
}

/// Get the path to the application's own known_hosts file
pub fn known_hosts_file() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("known_hosts"))
}

/// Default root under which remote filesystems are mounted.
///
/// Lives in the temp dir so stale mount points never survive a reboot.
pub fn default_mount_root() -> PathBuf {
    std::env::temp_dir().join("throttle-bridge.sftp")
}

/// Ensure the config directory exists with proper permissions
pub fn ensure_config_dir() -> std::io::Result<PathBuf> {
    let dir = config_dir().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine config directory",
        )
    })?;

    ensure_private_dir(&dir)?;
    Ok(dir)
}

/// Create `dir` (recursively) and restrict it to the owner on Unix.
pub fn ensure_private_dir(dir: &std::path::Path) -> std::io::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    Ok(())
}

/// Expand tilde in path (e.g., ~/.ssh/known_hosts -> /home/user/.ssh/known_hosts)
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Get the user's home directory
fn dirs_home() -> Option<PathBuf> {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .or_else(|| std::env::var("HOME").ok().map(PathBuf::from))
}

/// Get the log directory path
pub fn log_dir() -> Option<PathBuf> {
    if let Ok(raw) = std::env::var(LOG_DIR_ENV) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        return Some(PathBuf::from(trimmed));
    }

    config_dir().map(|d| d.join("logs"))
}

/// Ensure the log directory exists with proper permissions
pub fn ensure_log_dir() -> std::io::Result<PathBuf> {
    let dir = log_dir().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine log directory",
        )
    })?;

    ensure_private_dir(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_with_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(!path.to_string_lossy().starts_with("~/"));
        assert!(path.to_string_lossy().ends_with("test/file.txt"));
    }

    #[test]
    fn test_expand_tilde_without_tilde() {
        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_servers_file_ends_with_toml() {
        let path = servers_file();
        assert!(path.is_some());
        assert!(path.unwrap().to_string_lossy().ends_with("servers.toml"));
    }

    #[test]
    fn test_default_mount_root_is_in_temp_dir() {
        let root = default_mount_root();
        assert!(root.starts_with(std::env::temp_dir()));
        assert!(root.ends_with("throttle-bridge.sftp"));
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_private_dir_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("temp dir");
        let dir = tmp.path().join("a/b/c");
        ensure_private_dir(&dir).expect("create dir");

        let mode = std::fs::metadata(&dir).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
