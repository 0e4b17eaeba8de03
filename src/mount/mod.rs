//! Remote directories mounted locally through sshfs.

pub mod command;
pub mod key;
mod manager;

pub use command::{CommandOutput, CommandRunner, CommandSpec, MountCredential, TokioCommandRunner};
pub use key::{mount_key, mount_path};
pub use manager::{MountLifecycleManager, MountStatus};
