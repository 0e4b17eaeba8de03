//! Common test utilities: in-memory stand-ins for SSH, SFTP and subprocesses

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use throttle_bridge::config::ServerConfig;
use throttle_bridge::error::{SftpError, SshError};
use throttle_bridge::mount::{CommandOutput, CommandRunner, CommandSpec};
use throttle_bridge::sftp::{RemoteFs, RemoteReader, RemoteWriter};
use throttle_bridge::ssh::{DirectChannel, SshConnector, SshTransport};

/// Fail the test instead of hanging
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out")
}

/// Remote files kept in a map. Writes become visible once the writer is
/// shut down, like an SFTP handle being closed. Files under `/stall/` hand
/// out their content and then never reach EOF.
#[derive(Default)]
pub struct MemoryFs {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    closed: AtomicBool,
}

impl MemoryFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.files.lock().insert(path.to_string(), content.into());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteFs for MemoryFs {
    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        match self.files.lock().get(path) {
            Some(content) if path.starts_with("/stall/") => Ok(Box::new(Cursor::new(content.clone()).chain(Stalled))),
            Some(content) => Ok(Box::new(Cursor::new(content.clone()))),
            None => Err(SftpError::FileOperation(format!("No such file: {}", path))),
        }
    }

    async fn open_write(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        if path.starts_with("/readonly/") {
            return Err(SftpError::FileOperation(format!("Permission denied: {}", path)));
        }
        Ok(Box::new(MemoryWriter {
            path: path.to_string(),
            buf: Vec::new(),
            files: self.files.clone(),
        }))
    }

    async fn close(&self) -> Result<(), SftpError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A remote read that hangs
struct Stalled;

impl AsyncRead for Stalled {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Poll::Pending
    }
}

struct MemoryWriter {
    path: String,
    buf: Vec<u8>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, data: &[u8]) -> Poll<std::io::Result<usize>> {
        self.get_mut().buf.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        this.files
            .lock()
            .insert(this.path.clone(), std::mem::take(&mut this.buf));
        Poll::Ready(Ok(()))
    }
}

/// Transport whose direct channels are plain TCP connections to
/// `host:port` on this machine, and whose SFTP session is a [`MemoryFs`].
pub struct LoopbackTransport {
    fs: Arc<MemoryFs>,
    fail_connect: bool,
    stall_connect: bool,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackTransport {
    pub fn new(fs: Arc<MemoryFs>) -> Arc<Self> {
        Arc::new(Self {
            fs,
            fail_connect: false,
            stall_connect: false,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fs: MemoryFs::new(),
            fail_connect: true,
            stall_connect: false,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// A server that accepts TCP but never finishes the handshake; connect
    /// only returns once the transport is closed
    pub fn stalling() -> Arc<Self> {
        Arc::new(Self {
            fs: MemoryFs::new(),
            fail_connect: false,
            stall_connect: true,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SshTransport for LoopbackTransport {
    async fn connect(&self) -> Result<(), SshError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SshError::NotConnected);
        }
        if self.fail_connect {
            return Err(SshError::AuthenticationFailed("Authentication rejected by server".into()));
        }
        if self.stall_connect {
            while !self.closed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            return Err(SshError::NotConnected);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn open_direct_channel(&self, host: &str, port: u16) -> Result<DirectChannel, SshError> {
        if !self.is_open() {
            return Err(SshError::NotConnected);
        }
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| SshError::Channel(format!("direct-tcpip to {}:{} failed: {}", host, port, e)))?;
        Ok(Box::new(stream))
    }

    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>, SftpError> {
        if !self.is_open() {
            return Err(SshError::NotConnected.into());
        }
        Ok(self.fs.clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn target(&self) -> String {
        "test@loopback:22".to_string()
    }
}

/// Hands out loopback transports; the first `failures` connect attempts fail
pub struct LoopbackConnector {
    pub fs: Arc<MemoryFs>,
    failures: AtomicUsize,
    pub created: Mutex<Vec<Arc<LoopbackTransport>>>,
}

impl LoopbackConnector {
    pub fn new(fs: Arc<MemoryFs>) -> Arc<Self> {
        Self::failing_first(fs, 0)
    }

    pub fn failing_first(fs: Arc<MemoryFs>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            fs,
            failures: AtomicUsize::new(failures),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

impl SshConnector for LoopbackConnector {
    fn connection(&self, _server: &ServerConfig) -> Arc<dyn SshTransport> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let transport = if fail {
            LoopbackTransport::failing()
        } else {
            LoopbackTransport::new(self.fs.clone())
        };
        self.created.lock().push(transport.clone());
        transport
    }
}

/// Records every command; fails those whose command line contains one of
/// the configured fragments
#[derive(Default)]
pub struct RecordingRunner {
    pub commands: Mutex<Vec<CommandSpec>>,
    failing: Mutex<Vec<String>>,
    stdout: Mutex<String>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_when_contains(&self, fragment: &str) {
        self.failing.lock().push(fragment.to_string());
    }

    /// Every command takes this long before it reports
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn set_stdout(&self, stdout: &str) {
        *self.stdout.lock() = stdout.to_string();
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.commands.lock().iter().map(CommandSpec::display).collect()
    }

    pub fn count_program(&self, program: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.program == program)
            .count()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        self.commands.lock().push(spec.clone());
        let line = spec.display();
        let failed = self.failing.lock().iter().any(|f| line.contains(f.as_str()));
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(CommandOutput {
            success: !failed,
            code: Some(if failed { 1 } else { 0 }),
            stdout: self.stdout.lock().clone(),
            stderr: if failed { "simulated failure".to_string() } else { String::new() },
        })
    }
}

/// Echo server on an ephemeral port; returns its port
pub async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let port = listener.local_addr().expect("echo addr").port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}

/// A port nothing listens on
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

/// FTP control client for tests
pub struct FtpClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl FtpClient {
    /// Connect and consume the greeting
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect gateway");
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        let greeting = client.reply().await;
        assert!(greeting.starts_with("220 "), "greeting: {greeting}");
        client
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .expect("send command");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("send raw");
    }

    /// Next reply line without the terminator; empty on EOF
    pub async fn reply(&mut self) -> String {
        let mut line = String::new();
        within(self.reader.read_line(&mut line)).await.expect("read reply");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    pub async fn command(&mut self, line: &str) -> String {
        self.send(line).await;
        self.reply().await
    }

    /// PASV and connect to the advertised address
    pub async fn passive(&mut self) -> TcpStream {
        let reply = self.command("PASV").await;
        assert!(reply.starts_with("227 Entering Passive Mode ("), "PASV: {reply}");
        let inner = reply
            .split_once('(')
            .and_then(|(_, rest)| rest.split_once(')'))
            .map(|(inner, _)| inner)
            .expect("PASV tuple");
        let n: Vec<u16> = inner.split(',').map(|p| p.parse().expect("octet")).collect();
        let host = format!("{}.{}.{}.{}", n[0], n[1], n[2], n[3]);
        let port = n[4] * 256 + n[5];
        TcpStream::connect((host.as_str(), port)).await.expect("connect data")
    }

    pub async fn retrieve(&mut self, path: &str) -> (String, Vec<u8>, String) {
        let mut data = self.passive().await;
        let opening = self.command(&format!("RETR {}", path)).await;
        let mut received = Vec::new();
        within(data.read_to_end(&mut received)).await.expect("read data");
        let done = self.reply().await;
        (opening, received, done)
    }

    pub async fn store(&mut self, path: &str, payload: &[u8]) -> (String, String) {
        let mut data = self.passive().await;
        let opening = self.command(&format!("STOR {}", path)).await;
        data.write_all(payload).await.expect("write data");
        data.shutdown().await.expect("shutdown data");
        drop(data);
        let done = self.reply().await;
        (opening, done)
    }
}
