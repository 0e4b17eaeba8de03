//! One FTP client: a control connection plus at most one pending data
//! connection, translated onto the shared SFTP sub-session.

use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::FtpError;
use crate::sftp::RemoteFs;

use super::command::{self, Command, LIST_PLACEHOLDER, MAX_LINE_LEN, Reply};

/// RETR/STOR chunk size
pub const TRANSFER_CHUNK: usize = 32 * 1024;

/// Data connection requested by the last PASV or PORT. Consumed by the next
/// transfer.
#[derive(Debug, Default)]
enum DataMode {
    #[default]
    None,
    Passive(TcpListener),
    Active(SocketAddrV4),
}

enum Transfer {
    Retrieve(String),
    Store(String),
}

pub struct FtpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    fs: Arc<dyn RemoteFs>,
    cwd: String,
    data: DataMode,
    passive_ip: Ipv4Addr,
    data_timeout: Duration,
}

impl FtpSession {
    pub fn new(control: TcpStream, fs: Arc<dyn RemoteFs>, data_timeout: Duration) -> Self {
        let passive_ip = match control.local_addr().map(|a| a.ip()) {
            Ok(IpAddr::V4(ip)) if !ip.is_unspecified() => ip,
            Ok(IpAddr::V6(ip)) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::LOCALHOST),
            _ => Ipv4Addr::LOCALHOST,
        };
        let (reader, writer) = control.into_split();

        Self {
            reader: BufReader::new(reader),
            writer,
            fs,
            cwd: "/".to_string(),
            data: DataMode::None,
            passive_ip,
            data_timeout,
        }
    }

    /// Serve commands until QUIT, EOF or a control-channel error
    pub async fn run(mut self) -> Result<(), FtpError> {
        self.reply(Reply::greeting()).await?;

        let mut line = Vec::with_capacity(256);
        loop {
            line.clear();
            let n = (&mut self.reader)
                .take(MAX_LINE_LEN as u64 + 1)
                .read_until(b'\n', &mut line)
                .await?;
            if n == 0 {
                debug!("FTP client closed control connection");
                return Ok(());
            }
            if line.len() > MAX_LINE_LEN && !line.ends_with(b"\n") {
                self.reply(Reply::new(500, "Command line too long")).await?;
                return Ok(());
            }

            let text = String::from_utf8_lossy(&line);
            let command = Command::parse(&text);
            debug!("FTP command: {:?}", command);

            if !self.handle(command).await? {
                return Ok(());
            }
        }
    }

    /// Returns false once the session should end
    async fn handle(&mut self, command: Command) -> Result<bool, FtpError> {
        match command {
            Command::User(_) => self.reply(Reply::new(331, "User name okay, need password")).await?,
            Command::Pass => self.reply(Reply::new(230, "User logged in")).await?,
            Command::Syst => self.reply(Reply::new(215, "UNIX Type: L8")).await?,
            Command::Pwd => {
                let text = format!("\"{}\" is current directory", self.cwd);
                self.reply(Reply::new(257, text)).await?
            }
            Command::Type(kind) => self.reply(Reply::new(200, format!("Type set to {}", kind))).await?,
            Command::Cwd(dir) => {
                // No existence check
                self.cwd = command::resolve_path(&self.cwd, &dir);
                let text = format!("Directory changed to {}", self.cwd);
                self.reply(Reply::new(250, text)).await?
            }
            Command::Cdup => {
                self.cwd = command::parent_dir(&self.cwd);
                let text = format!("Directory changed to {}", self.cwd);
                self.reply(Reply::new(250, text)).await?
            }
            Command::Pasv => self.passive().await?,
            Command::Port(arg) => match command::parse_port(&arg) {
                Ok(addr) => {
                    self.data = DataMode::Active(addr);
                    self.reply(Reply::new(200, "PORT command successful")).await?
                }
                Err(e) => self.reply(Reply::new(501, e.to_string())).await?,
            },
            Command::List => self.list().await?,
            Command::Retr(path) => {
                let path = command::resolve_path(&self.cwd, &path);
                self.transfer(Transfer::Retrieve(path)).await?
            }
            Command::Stor(path) => {
                let path = command::resolve_path(&self.cwd, &path);
                self.transfer(Transfer::Store(path)).await?
            }
            Command::Quit => {
                self.reply(Reply::new(221, "Goodbye")).await?;
                return Ok(false);
            }
            Command::Ignored(_) => self.reply(Reply::new(200, "Command OK")).await?,
            Command::Unknown(_) => self.reply(Reply::new(502, "Command not implemented")).await?,
        }
        Ok(true)
    }

    async fn reply(&mut self, reply: Reply) -> Result<(), FtpError> {
        self.writer.write_all(reply.to_line().as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn passive(&mut self) -> Result<(), FtpError> {
        let listener = match TcpListener::bind((self.passive_ip, 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("PASV bind on {} failed: {}", self.passive_ip, e);
                return self.reply(Reply::new(425, "Cannot open data connection")).await;
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!("PASV listener has no address: {}", e);
                return self.reply(Reply::new(425, "Cannot open data connection")).await;
            }
        };

        // A newer PASV replaces any listener still pending
        self.data = DataMode::Passive(listener);
        let encoded = command::format_pasv(SocketAddrV4::new(self.passive_ip, port));
        self.reply(Reply::new(227, format!("Entering Passive Mode ({})", encoded)))
            .await
    }

    /// Take the pending data mode and produce its single stream
    async fn open_data(&mut self) -> Result<TcpStream, FtpError> {
        match mem::take(&mut self.data) {
            DataMode::None => Err(FtpError::NoDataConnection),
            DataMode::Passive(listener) => {
                let (stream, peer) = timeout(self.data_timeout, listener.accept())
                    .await
                    .map_err(|_| FtpError::DataConnection("passive accept timed out".into()))?
                    .map_err(|e| FtpError::DataConnection(e.to_string()))?;
                debug!("FTP data connection from {} (passive)", peer);
                Ok(stream)
            }
            DataMode::Active(addr) => {
                let stream = timeout(self.data_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| FtpError::DataConnection(format!("connect to {} timed out", addr)))?
                    .map_err(|e| FtpError::DataConnection(format!("connect to {}: {}", addr, e)))?;
                debug!("FTP data connection to {} (active)", addr);
                Ok(stream)
            }
        }
    }

    async fn list(&mut self) -> Result<(), FtpError> {
        self.reply(Reply::new(150, "Opening data connection for directory listing"))
            .await?;
        let mut data = match self.open_data().await {
            Ok(data) => data,
            Err(e) => {
                debug!("LIST without data connection: {}", e);
                return self.reply(Reply::no_data_connection()).await;
            }
        };

        if let Err(e) = data.write_all(LIST_PLACEHOLDER.as_bytes()).await {
            debug!("Error sending listing: {}", e);
        }
        let _ = data.shutdown().await;
        drop(data);
        self.reply(Reply::transfer_complete()).await
    }

    async fn transfer(&mut self, transfer: Transfer) -> Result<(), FtpError> {
        let opening = match &transfer {
            Transfer::Retrieve(_) => "Opening data connection for file transfer",
            Transfer::Store(_) => "Opening data connection for file upload",
        };
        self.reply(Reply::new(150, opening)).await?;

        let data = match self.open_data().await {
            Ok(data) => data,
            Err(e) => {
                debug!("Transfer without data connection: {}", e);
                return self.reply(Reply::no_data_connection()).await;
            }
        };

        let reply = match transfer {
            Transfer::Retrieve(path) => retrieve(self.fs.as_ref(), &path, data).await,
            Transfer::Store(path) => store(self.fs.as_ref(), &path, data).await,
        };
        self.reply(reply).await
    }
}

/// Where a transfer broke
enum TransferFailure {
    Remote(String),
    Data(std::io::Error),
}

async fn retrieve(fs: &dyn RemoteFs, path: &str, mut data: TcpStream) -> Reply {
    let reader = match fs.open_read(path).await {
        Ok(reader) => reader,
        Err(e) => {
            warn!("Error retrieving {}: {}", path, e);
            return Reply::new(550, format!("Error retrieving file: {}", e));
        }
    };

    let result = pump_chunks(reader, &mut data, false).await;
    let _ = data.shutdown().await;
    drop(data);

    match result {
        Ok(sent) => {
            debug!("Sent {} bytes of {}", sent, path);
            Reply::transfer_complete()
        }
        Err(TransferFailure::Remote(e)) => {
            warn!("Error retrieving {}: {}", path, e);
            Reply::new(550, format!("Error retrieving file: {}", e))
        }
        Err(TransferFailure::Data(e)) => {
            debug!("Data connection dropped during RETR {}: {}", path, e);
            Reply::new(426, "Connection closed; transfer aborted")
        }
    }
}

async fn store(fs: &dyn RemoteFs, path: &str, mut data: TcpStream) -> Reply {
    let writer = match fs.open_write(path).await {
        Ok(writer) => writer,
        Err(e) => {
            warn!("Error storing {}: {}", path, e);
            return Reply::new(550, format!("Error storing file: {}", e));
        }
    };

    let result = pump_chunks(&mut data, writer, true).await;
    drop(data);

    match result {
        Ok(offset) => {
            debug!("Stored {} bytes to {}", offset, path);
            Reply::transfer_complete()
        }
        Err(TransferFailure::Remote(e)) => {
            warn!("Error storing {}: {}", path, e);
            Reply::new(550, format!("Error storing file: {}", e))
        }
        Err(TransferFailure::Data(e)) => {
            debug!("Data connection dropped during STOR {}: {}", path, e);
            Reply::new(426, "Connection closed; transfer aborted")
        }
    }
}

/// Copy in fixed-size chunks until EOF. `remote_is_writer` says which side
/// is SFTP, so failures are attributed correctly. The writer is shut down
/// at EOF, which for SFTP closes the remote file.
async fn pump_chunks<R, W>(mut reader: R, mut writer: W, remote_is_writer: bool) -> Result<u64, TransferFailure>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let on_read = |e: std::io::Error| {
        if remote_is_writer { TransferFailure::Data(e) } else { TransferFailure::Remote(e.to_string()) }
    };
    let on_write = |e: std::io::Error| {
        if remote_is_writer { TransferFailure::Remote(e.to_string()) } else { TransferFailure::Data(e) }
    };

    let mut buf = vec![0u8; TRANSFER_CHUNK];
    let mut offset = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(on_read)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await.map_err(on_write)?;
        offset += n as u64;
    }
    writer.shutdown().await.map_err(on_write)?;
    Ok(offset)
}
