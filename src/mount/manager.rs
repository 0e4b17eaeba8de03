use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use russh::keys::ssh_key::LineEnding;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AuthMode, MountSettings, ServerConfig};
use crate::error::MountError;
use crate::secrets::{SecretKind, SecretStore};
use crate::security_log;
use crate::ssh::HostKeyPolicy;

use super::command::{self, CommandRunner, CommandSpec, MountCredential};
use super::key;

/// Mounted flag and last error of one mount key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountStatus {
    pub mounted: bool,
    pub last_error: Option<String>,
    pub changed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone)]
struct MountEntry {
    mount_path: PathBuf,
    staged_key: Option<PathBuf>,
    /// Ids of the servers sharing this mount
    users: HashSet<Uuid>,
}

/// `None` until the mounting caller finishes
type Outcome = Option<Result<PathBuf, MountError>>;

#[derive(Default)]
struct MountTable {
    entries: HashMap<String, MountEntry>,
    in_flight: HashMap<String, watch::Sender<Outcome>>,
    statuses: HashMap<String, MountStatus>,
}

impl MountTable {
    fn evict(&mut self, key: &str) -> Option<MountEntry> {
        let entry = self.entries.remove(key);
        if entry.is_some() {
            self.record(key, false, None);
        }
        entry
    }

    fn record(&mut self, key: &str, mounted: bool, last_error: Option<String>) {
        self.statuses.insert(
            key.to_string(),
            MountStatus {
                mounted,
                last_error,
                changed_at: Some(chrono::Utc::now()),
            },
        );
    }
}

/// Clears the in-flight mark if `mount` is cancelled before finishing.
/// Waiters then see the channel close and retry.
struct InFlight<'a> {
    table: &'a Mutex<MountTable>,
    key: Option<String>,
}

impl InFlight<'_> {
    /// Publish the outcome to every waiter
    fn finish(&mut self, table: &mut MountTable, outcome: Result<PathBuf, MountError>) {
        if let Some(key) = self.key.take() {
            if let Some(sender) = table.in_flight.remove(&key) {
                sender.send_replace(Some(outcome));
            }
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.table.lock().in_flight.remove(&key);
        }
    }
}

enum Claim {
    Mounted(PathBuf),
    Wait(watch::Receiver<Outcome>),
    Owner,
}

async fn wait_outcome(mut outcome: watch::Receiver<Outcome>) -> Outcome {
    let published = outcome.wait_for(Option::is_some).await.ok()?;
    (*published).clone()
}

/// Mounts remote directories through sshfs and tracks them by mount key.
pub struct MountLifecycleManager {
    settings: MountSettings,
    mount_root: PathBuf,
    policy: HostKeyPolicy,
    secrets: Arc<dyn SecretStore>,
    service: String,
    runner: Arc<dyn CommandRunner>,
    table: Mutex<MountTable>,
}

impl MountLifecycleManager {
    pub fn new(
        settings: MountSettings,
        policy: HostKeyPolicy,
        secrets: Arc<dyn SecretStore>,
        service: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let mount_root = settings.mount_root();
        Self {
            settings,
            mount_root,
            policy,
            secrets,
            service: service.into(),
            runner,
            table: Mutex::new(MountTable::default()),
        }
    }

    pub fn mount_root(&self) -> &std::path::Path {
        &self.mount_root
    }

    pub fn mount_key(server: &ServerConfig) -> String {
        key::mount_key(&server.host, &server.path)
    }

    pub fn mount_path(&self, server: &ServerConfig) -> PathBuf {
        key::mount_path(&self.mount_root, &Self::mount_key(server))
    }

    /// Mount `server.path` on its local mount point and return that path.
    ///
    /// A key that is already mounted is shared with `server` without
    /// spawning sshfs. A caller that finds the key being mounted waits for
    /// that attempt and gets its result, success or failure.
    pub async fn mount(&self, server: &ServerConfig) -> Result<PathBuf, MountError> {
        for (field, value) in [("user", &server.user), ("host", &server.host), ("path", &server.path)] {
            if value.trim().is_empty() {
                return Err(MountError::InvalidServerConfiguration(format!(
                    "server '{}' is missing {}",
                    server.name, field
                )));
            }
        }

        let mount_key = Self::mount_key(server);
        let mount_path = key::mount_path(&self.mount_root, &mount_key);

        loop {
            match self.claim(&mount_key, server.id) {
                Claim::Mounted(path) => {
                    debug!("{} already mounted", mount_key);
                    return Ok(path);
                }
                Claim::Wait(outcome) => {
                    debug!("{} is already being mounted; waiting", mount_key);
                    // On success the next claim joins the new entry. `None`
                    // means the mounting caller went away; try again.
                    if let Some(Err(e)) = wait_outcome(outcome).await {
                        return Err(e);
                    }
                }
                Claim::Owner => break,
            }
        }
        let mut in_flight = InFlight {
            table: &self.table,
            key: Some(mount_key.clone()),
        };

        let result = self.spawn_mount(server, &mount_key, &mount_path).await;

        let mut table = self.table.lock();
        match result {
            Ok(staged_key) => {
                table.entries.insert(
                    mount_key.clone(),
                    MountEntry {
                        mount_path: mount_path.clone(),
                        staged_key,
                        users: HashSet::from([server.id]),
                    },
                );
                table.record(&mount_key, true, None);
                in_flight.finish(&mut table, Ok(mount_path.clone()));
                drop(table);

                security_log::log_mount(
                    &mount_key,
                    &mount_path.display().to_string(),
                    server.auth.as_str(),
                );
                info!("Mounted {} on {}", mount_key, mount_path.display());
                Ok(mount_path)
            }
            Err(e) => {
                table.record(&mount_key, false, Some(e.to_string()));
                in_flight.finish(&mut table, Err(e.clone()));
                drop(table);

                warn!("Mount of {} failed: {}", mount_key, e);
                Err(e)
            }
        }
    }

    fn claim(&self, mount_key: &str, user: Uuid) -> Claim {
        let mut table = self.table.lock();
        if let Some(entry) = table.entries.get_mut(mount_key) {
            entry.users.insert(user);
            return Claim::Mounted(entry.mount_path.clone());
        }
        if let Some(sender) = table.in_flight.get(mount_key) {
            return Claim::Wait(sender.subscribe());
        }
        table
            .in_flight
            .insert(mount_key.to_string(), watch::channel(None).0);
        Claim::Owner
    }

    /// Returns the staged key file, if one was written. A mount directory
    /// created by this attempt is removed again when the attempt fails.
    async fn spawn_mount(
        &self,
        server: &ServerConfig,
        mount_key: &str,
        mount_path: &std::path::Path,
    ) -> Result<Option<PathBuf>, MountError> {
        let created = !mount_path.exists();
        std::fs::create_dir_all(mount_path).map_err(|source| MountError::DirectoryCreationFailed {
            path: mount_path.to_path_buf(),
            source: Arc::new(source),
        })?;

        let result = self.run_sshfs(server, mount_key, mount_path).await;
        if result.is_err() && created {
            // Only succeeds while the directory is still empty
            if let Err(e) = std::fs::remove_dir(mount_path) {
                debug!("Leaving mount directory {}: {}", mount_path.display(), e);
            }
        }
        result
    }

    async fn run_sshfs(
        &self,
        server: &ServerConfig,
        mount_key: &str,
        mount_path: &std::path::Path,
    ) -> Result<Option<PathBuf>, MountError> {
        let (credential, staged_key) = self.credential(server)?;
        let spec = command::sshfs_command(&self.settings, &self.policy, server, mount_path, credential);

        let failure = match self.runner.run(&spec).await {
            Ok(output) if output.success => return Ok(staged_key),
            Ok(output) => output.failure_reason(),
            Err(e) => format!("failed to launch {}: {}", spec.program, e),
        };

        if let Some(path) = &staged_key {
            key::remove_staged_key(path);
        }
        Err(MountError::MountProcessFailed {
            key: mount_key.to_string(),
            reason: failure,
        })
    }

    fn secret(&self, server: &ServerConfig, kind: SecretKind) -> Result<Option<SecretString>, MountError> {
        self.secrets
            .get(&self.service, &kind.key_for(&server.name))
            .map_err(|source| MountError::SecretStore {
                server: server.name.clone(),
                source,
            })
    }

    fn credential(&self, server: &ServerConfig) -> Result<(MountCredential, Option<PathBuf>), MountError> {
        match server.auth {
            AuthMode::Password => {
                let password = self
                    .secret(server, SecretKind::Password)?
                    .ok_or_else(|| MountError::MissingCredentials(server.name.clone()))?;
                Ok((MountCredential::Password(password), None))
            }
            AuthMode::Key => {
                let private_key = self
                    .secret(server, SecretKind::PrivateKey)?
                    .ok_or_else(|| MountError::MissingCredentials(server.name.clone()))?;
                // sshfs cannot prompt, so a protected key is staged decrypted
                let private_key = match self.secret(server, SecretKind::Passphrase)? {
                    Some(passphrase) => decrypted_key(server, &private_key, &passphrase)?,
                    None => private_key,
                };
                let path = key::stage_private_key(&self.mount_root, &private_key)?;
                Ok((MountCredential::IdentityFile(path.clone()), Some(path)))
            }
        }
    }

    /// Release `server`'s use of its mount. The filesystem is only
    /// unmounted once no other server shares the mount key.
    pub async fn unmount(&self, server: &ServerConfig) -> Result<(), MountError> {
        let mount_key = Self::mount_key(server);
        let entry = {
            let mut table = self.table.lock();
            let Some(entry) = table.entries.get_mut(&mount_key) else {
                return Ok(());
            };
            entry.users.remove(&server.id);
            if !entry.users.is_empty() {
                debug!("{} is still used by {} server(s)", mount_key, entry.users.len());
                return Ok(());
            }
            table.evict(&mount_key)
        };
        self.release(&mount_key, entry).await
    }

    /// Unmount `mount_key` for every server sharing it, escalating to the
    /// forced variant once.
    ///
    /// The entry is evicted and its staged key removed whatever the
    /// subprocesses report. Unknown keys are a no-op.
    pub async fn unmount_key(&self, mount_key: &str) -> Result<(), MountError> {
        let entry = self.table.lock().evict(mount_key);
        self.release(mount_key, entry).await
    }

    async fn release(&self, mount_key: &str, entry: Option<MountEntry>) -> Result<(), MountError> {
        let Some(entry) = entry else {
            return Ok(());
        };

        let result = self.run_unmount(mount_key, &entry).await;

        if let Some(path) = &entry.staged_key {
            key::remove_staged_key(path);
        }
        match &result {
            Ok(forced) => {
                security_log::log_unmount(mount_key, *forced);
                info!("Unmounted {}", mount_key);
            }
            Err(e) => {
                warn!("{}", e);
                self.table.lock().record(mount_key, false, Some(e.to_string()));
            }
        }
        result.map(|_| ())
    }

    /// Ok(forced)
    async fn run_unmount(&self, mount_key: &str, entry: &MountEntry) -> Result<bool, MountError> {
        let graceful = command::unmount_command(&self.settings, &entry.mount_path);
        let first_failure = match self.run_checked(&graceful).await {
            Ok(()) => return Ok(false),
            Err(reason) => reason,
        };
        debug!("Graceful unmount of {} failed ({}), forcing", mount_key, first_failure);

        let Some(forced) = command::force_unmount_command(&self.settings, &entry.mount_path) else {
            return Err(MountError::UnmountFailed {
                key: mount_key.to_string(),
                reason: first_failure,
            });
        };
        match self.run_checked(&forced).await {
            Ok(()) => Ok(true),
            Err(reason) => Err(MountError::UnmountFailed {
                key: mount_key.to_string(),
                reason: format!("{}; forced: {}", first_failure, reason),
            }),
        }
    }

    async fn run_checked(&self, spec: &CommandSpec) -> Result<(), String> {
        match self.runner.run(spec).await {
            Ok(output) if output.success => Ok(()),
            Ok(output) => Err(output.failure_reason()),
            Err(e) => Err(format!("failed to launch {}: {}", spec.program, e)),
        }
    }

    /// Mount every server marked for browsing. Failures are collected by
    /// server name and do not stop the sweep.
    pub async fn mount_all(&self, servers: &[ServerConfig]) -> Vec<(String, MountError)> {
        let mut failures = Vec::new();
        for server in servers.iter().filter(|s| s.browse) {
            if let Err(e) = self.mount(server).await {
                failures.push((server.name.clone(), e));
            }
        }
        failures
    }

    /// Unmount everything concurrently. Every entry is evicted even when its
    /// unmount fails; failures are returned by mount key.
    pub async fn unmount_all(&self) -> Vec<(String, MountError)> {
        let keys: Vec<String> = self.table.lock().entries.keys().cloned().collect();
        let results = join_all(keys.iter().map(|k| self.unmount_key(k))).await;
        keys.into_iter()
            .zip(results)
            .filter_map(|(mount_key, result)| result.err().map(|e| (mount_key, e)))
            .collect()
    }

    /// Check each recorded mount and drop the ones whose filesystem is gone.
    /// Returns the keys that were dropped.
    pub async fn check_health(&self) -> Vec<String> {
        let snapshot: Vec<(String, MountEntry)> = self
            .table
            .lock()
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();

        let mut lost = Vec::new();
        for (mount_key, entry) in snapshot {
            let df = command::health_probe_command(&self.settings, &entry.mount_path);
            let alive = match self.runner.run(&df).await {
                Ok(output) => output.success && command::probe_reports_mounted(&output.stdout, &entry.mount_path),
                Err(e) => {
                    debug!("Health probe for {} failed to run: {}", mount_key, e);
                    false
                }
            };
            if alive {
                continue;
            }

            warn!("Mount {} is no longer present", mount_key);
            {
                let mut table = self.table.lock();
                table.entries.remove(&mount_key);
                table.record(&mount_key, false, Some("filesystem no longer mounted".to_string()));
            }
            if let Some(path) = &entry.staged_key {
                key::remove_staged_key(path);
            }
            lost.push(mount_key);
        }
        lost
    }

    /// Number of servers sharing `mount_key`
    pub fn user_count(&self, mount_key: &str) -> usize {
        self.table
            .lock()
            .entries
            .get(mount_key)
            .map_or(0, |e| e.users.len())
    }

    pub fn status(&self, mount_key: &str) -> Option<MountStatus> {
        self.table.lock().statuses.get(mount_key).cloned()
    }

    pub fn statuses(&self) -> HashMap<String, MountStatus> {
        self.table.lock().statuses.clone()
    }

    pub fn is_mounted(&self, mount_key: &str) -> bool {
        self.table.lock().entries.contains_key(mount_key)
    }

    pub fn mounted_keys(&self) -> Vec<String> {
        self.table.lock().entries.keys().cloned().collect()
    }

    pub fn mounted_path(&self, mount_key: &str) -> Option<PathBuf> {
        self.table
            .lock()
            .entries
            .get(mount_key)
            .map(|e| e.mount_path.clone())
    }
}

fn decrypted_key(
    server: &ServerConfig,
    private_key: &SecretString,
    passphrase: &SecretString,
) -> Result<SecretString, MountError> {
    let decoded = crate::ssh::decode_private_key(&server.name, private_key.expose_secret(), Some(passphrase))
        .map_err(|e| MountError::KeyStagingFailed(e.to_string()))?;
    let openssh = decoded
        .to_openssh(LineEnding::LF)
        .map_err(|e| MountError::KeyStagingFailed(format!("re-encoding key for '{}': {}", server.name, e)))?;
    Ok(SecretString::from(openssh.as_str().to_string()))
}
