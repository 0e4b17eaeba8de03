//! russh-sftp backed [`RemoteFs`]

use async_trait::async_trait;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::OpenFlags;

use crate::error::SftpError;

use super::{RemoteFs, RemoteReader, RemoteWriter};

/// SFTP sub-session over one SSH connection.
///
/// russh-sftp multiplexes requests by id and every `File` owns its own
/// handle, so concurrent transfers need no extra locking here.
pub struct SftpSession {
    sftp: RusshSftpSession,
    target: String,
}

impl std::fmt::Debug for SftpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSession")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl SftpSession {
    /// Wrap an initialised russh-sftp session; `target` is only used in logs
    pub fn new(sftp: RusshSftpSession, target: impl Into<String>) -> Self {
        Self {
            sftp,
            target: target.into(),
        }
    }
}

#[async_trait]
impl RemoteFs for SftpSession {
    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        let file = self.sftp.open(path).await.map_err(|e| {
            SftpError::FileOperation(format!("Failed to open remote file {}: {}", path, e))
        })?;
        tracing::debug!(target = %self.target, "Opened {} for reading", path);
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        let file = self
            .sftp
            .open_with_flags(
                path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            )
            .await
            .map_err(|e| {
                SftpError::FileOperation(format!("Failed to open remote file {}: {}", path, e))
            })?;
        tracing::debug!(target = %self.target, "Opened {} for writing", path);
        Ok(Box::new(file))
    }

    async fn close(&self) -> Result<(), SftpError> {
        self.sftp
            .close()
            .await
            .map_err(|e| SftpError::ConnectionFailed(format!("Failed to close SFTP session: {}", e)))
    }
}
