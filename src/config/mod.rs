pub mod paths;
pub mod servers;
pub mod settings;

use std::io::Write;
use std::path::Path;

pub use servers::{AuthMode, ServerConfig, ServersConfig};
pub use settings::{
    AppConfig, GatewaySettings, HostKeyPolicyKind, MountSettings, SecretsSettings, SshSettings,
    TunnelSettings,
};

/// Write `content` to `path` through a sibling temp file and rename, so a
/// crash mid-write never leaves a truncated config behind.
pub(crate) fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp, path)
}
