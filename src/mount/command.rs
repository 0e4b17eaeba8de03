//! sshfs / umount invocations and the subprocess seam that runs them.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{MountSettings, ServerConfig};
use crate::ssh::HostKeyPolicy;

/// A program invocation. A secret, if any, is fed on stdin and never
/// appears in `args`.
#[derive(Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<SecretString>,
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("stdin", &self.stdin.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `program args...` for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Short failure description for errors and status
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        let code = self
            .code
            .map(|c| format!("exit code {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string());
        if stderr.is_empty() {
            code
        } else {
            format!("{} ({})", code, stderr)
        }
    }
}

/// Runs external programs to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput>;
}

/// [`CommandRunner`] on `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(command = %spec.display(), "Spawning");
        let mut child = cmd.spawn()?;

        if let Some(secret) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(secret.expose_secret().as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.shutdown().await?;
            }
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// How sshfs authenticates
#[derive(Debug)]
pub enum MountCredential {
    IdentityFile(PathBuf),
    /// Sent through `password_stdin`
    Password(SecretString),
}

/// `ssh -o` options for the host-key policy
pub fn host_key_options(policy: &HostKeyPolicy) -> Vec<String> {
    match policy {
        HostKeyPolicy::AcceptAny => vec![
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
        ],
        HostKeyPolicy::KnownHosts { path } => vec![
            "StrictHostKeyChecking=yes".to_string(),
            format!("UserKnownHostsFile={}", path.display()),
        ],
        HostKeyPolicy::TrustFirstUse { path } => vec![
            "StrictHostKeyChecking=accept-new".to_string(),
            format!("UserKnownHostsFile={}", path.display()),
        ],
    }
}

/// `sshfs user@host:path <mount> -p <port> -o <options>`
pub fn sshfs_command(
    settings: &MountSettings,
    policy: &HostKeyPolicy,
    server: &ServerConfig,
    mount_path: &Path,
    credential: MountCredential,
) -> CommandSpec {
    let mut options = vec![
        format!("ServerAliveInterval={}", settings.server_alive_interval),
        format!("ServerAliveCountMax={}", settings.server_alive_count_max),
        "reconnect".to_string(),
        "auto_cache".to_string(),
        "kernel_cache".to_string(),
        format!("Compression={}", if settings.compression { "yes" } else { "no" }),
    ];
    if let Some(cipher) = settings.cipher.as_deref().filter(|c| !c.is_empty()) {
        options.push(format!("Ciphers={}", cipher));
    }
    options.extend(host_key_options(policy));

    let stdin = match credential {
        MountCredential::IdentityFile(path) => {
            options.push("PreferredAuthentications=publickey".to_string());
            options.push(format!("IdentityFile={}", path.display()));
            None
        }
        MountCredential::Password(password) => {
            options.push("password_stdin".to_string());
            Some(password)
        }
    };

    let remote = format!("{}@{}:{}", server.user.trim(), server.host.trim(), server.path.trim());
    let mut spec = CommandSpec::new(&settings.sshfs_program)
        .arg(remote)
        .arg(mount_path.display().to_string())
        .arg("-p")
        .arg(server.port.to_string())
        .arg("-o")
        .arg(options.join(","));
    spec.stdin = stdin;
    spec
}

pub fn unmount_command(settings: &MountSettings, mount_path: &Path) -> CommandSpec {
    CommandSpec::new(&settings.unmount_program).arg(mount_path.display().to_string())
}

/// The forced variant, or `None` when no force command is configured
pub fn force_unmount_command(settings: &MountSettings, mount_path: &Path) -> Option<CommandSpec> {
    let (program, args) = settings.force_unmount.split_first()?;
    let mut spec = CommandSpec::new(program);
    spec.args.extend(args.iter().cloned());
    Some(spec.arg(mount_path.display().to_string()))
}

pub fn health_probe_command(settings: &MountSettings, mount_path: &Path) -> CommandSpec {
    CommandSpec::new(&settings.health_probe_program).arg(mount_path.display().to_string())
}

/// True when `df` output reports a filesystem mounted exactly on `mount_path`
pub fn probe_reports_mounted(stdout: &str, mount_path: &Path) -> bool {
    let target = mount_path.display().to_string();
    stdout
        .lines()
        .skip(1)
        .any(|line| line.split_whitespace().last() == Some(target.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerConfig {
        let mut server = ServerConfig::new("box", "seed.example.com", "alice");
        server.path = "/srv/media".to_string();
        server.port = 2222;
        server
    }

    #[test]
    fn password_goes_to_stdin_not_argv() {
        let spec = sshfs_command(
            &MountSettings::default(),
            &HostKeyPolicy::AcceptAny,
            &server(),
            Path::new("/tmp/m/seed.example.com:srv:media"),
            MountCredential::Password(SecretString::from("hunter2".to_string())),
        );

        assert_eq!(spec.program, "sshfs");
        assert_eq!(spec.args[0], "alice@seed.example.com:/srv/media");
        assert_eq!(spec.args[1], "/tmp/m/seed.example.com:srv:media");
        assert_eq!(&spec.args[2..4], ["-p", "2222"]);
        let options = &spec.args[5];
        assert!(options.contains("ServerAliveInterval=30"));
        assert!(options.contains("ServerAliveCountMax=4"));
        assert!(options.contains("reconnect"));
        assert!(options.contains("StrictHostKeyChecking=no"));
        assert!(options.ends_with("password_stdin"));
        assert!(spec.args.iter().all(|a| !a.contains("hunter2")));
        assert_eq!(spec.stdin.as_ref().map(|s| s.expose_secret().to_string()), Some("hunter2".into()));
        assert!(!format!("{:?}", spec).contains("hunter2"));
    }

    #[test]
    fn identity_file_and_cipher_options() {
        let settings = MountSettings {
            compression: true,
            cipher: Some("aes128-gcm@openssh.com".to_string()),
            ..Default::default()
        };
        let policy = HostKeyPolicy::TrustFirstUse { path: PathBuf::from("/home/a/.ssh/known_hosts") };
        let spec = sshfs_command(
            &settings,
            &policy,
            &server(),
            Path::new("/m"),
            MountCredential::IdentityFile(PathBuf::from("/m/.keys/sshfs_key_1")),
        );

        let options = &spec.args[5];
        assert!(options.contains("Compression=yes"));
        assert!(options.contains("Ciphers=aes128-gcm@openssh.com"));
        assert!(options.contains("StrictHostKeyChecking=accept-new"));
        assert!(options.contains("UserKnownHostsFile=/home/a/.ssh/known_hosts"));
        assert!(options.contains("PreferredAuthentications=publickey,IdentityFile=/m/.keys/sshfs_key_1"));
        assert!(spec.stdin.is_none());
    }

    #[test]
    fn force_unmount_appends_path() {
        let settings = MountSettings {
            force_unmount: vec!["umount".into(), "-f".into()],
            ..Default::default()
        };
        let spec = force_unmount_command(&settings, Path::new("/m/k")).unwrap();
        assert_eq!(spec.display(), "umount -f /m/k");

        let none = MountSettings {
            force_unmount: Vec::new(),
            ..Default::default()
        };
        assert!(force_unmount_command(&none, Path::new("/m/k")).is_none());
    }

    #[test]
    fn df_probe_matches_mount_column() {
        let mounted = "Filesystem 1K-blocks Used Available Use% Mounted on\n\
                       alice@seed:/srv 1000 10 990 1% /tmp/tb/seed:srv\n";
        let parent = "Filesystem 1K-blocks Used Available Use% Mounted on\n\
                      /dev/sda1 1000 10 990 1% /\n";
        assert!(probe_reports_mounted(mounted, Path::new("/tmp/tb/seed:srv")));
        assert!(!probe_reports_mounted(parent, Path::new("/tmp/tb/seed:srv")));
    }

    #[test]
    fn failure_reason_includes_stderr() {
        let output = CommandOutput {
            success: false,
            code: Some(1),
            stderr: "read: Connection reset by peer\n".into(),
            ..Default::default()
        };
        assert_eq!(output.failure_reason(), "exit code 1 (read: Connection reset by peer)");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn tokio_runner_feeds_stdin() {
        let spec = CommandSpec {
            program: "cat".into(),
            args: Vec::new(),
            stdin: Some(SecretString::from("pw".to_string())),
        };
        let output = TokioCommandRunner.run(&spec).await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "pw\n");
    }
}
