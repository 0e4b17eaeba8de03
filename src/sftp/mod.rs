//! Remote file access over an SFTP sub-session.

mod session;

pub use session::SftpSession;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SftpError;

/// Readable remote file
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable remote file. Shutting the writer down closes the remote handle.
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The subset of SFTP the FTP gateway needs.
///
/// One instance is shared by every client of a gateway, so implementations
/// must allow several files to be open and transferring at once.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Open `path` for reading from offset 0
    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError>;

    /// Open `path` for writing, creating or truncating it
    async fn open_write(&self, path: &str) -> Result<RemoteWriter, SftpError>;

    /// End the sub-session. Open files fail afterwards.
    async fn close(&self) -> Result<(), SftpError>;
}
