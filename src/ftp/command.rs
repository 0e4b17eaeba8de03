//! FTP control-channel grammar: commands in, replies out.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::FtpError;

/// Longest control line accepted, terminator included
pub const MAX_LINE_LEN: usize = 4096;

/// The one entry LIST ever returns
pub const LIST_PLACEHOLDER: &str = "-rw-r--r-- 1 user group 0 Jan 01 2022 file.txt\r\n";

/// A parsed control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass,
    Syst,
    Pwd,
    Type(String),
    Cwd(String),
    Cdup,
    Pasv,
    Port(String),
    List,
    Retr(String),
    Stor(String),
    Quit,
    /// FEAT, OPTS, MODE, STRU, NOOP and STAT are acknowledged and ignored
    Ignored(String),
    Unknown(String),
}

impl Command {
    /// Parse one control line. The verb is case-insensitive; everything
    /// after the first space is the argument.
    pub fn parse(line: &str) -> Command {
        let line = line.trim_end_matches(['\r', '\n']).trim_start();
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };
        let verb = verb.to_ascii_uppercase();
        let arg = arg.to_string();

        match verb.as_str() {
            "USER" => Command::User(arg),
            "PASS" => Command::Pass,
            "SYST" => Command::Syst,
            "PWD" | "XPWD" => Command::Pwd,
            "TYPE" => Command::Type(arg),
            "CWD" | "XCWD" => Command::Cwd(arg),
            "CDUP" | "XCUP" => Command::Cdup,
            "PASV" => Command::Pasv,
            "PORT" => Command::Port(arg),
            "LIST" | "NLST" => Command::List,
            "RETR" => Command::Retr(arg),
            "STOR" => Command::Stor(arg),
            "QUIT" => Command::Quit,
            "FEAT" | "OPTS" | "MODE" | "STRU" | "NOOP" | "STAT" => Command::Ignored(verb),
            _ => Command::Unknown(verb),
        }
    }
}

/// `<code> <text>\r\n`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn greeting() -> Self {
        Self::new(220, "Anonymous FTP server ready")
    }

    pub fn no_data_connection() -> Self {
        Self::new(425, "No data connection established")
    }

    pub fn transfer_complete() -> Self {
        Self::new(226, "Transfer complete")
    }

    pub fn to_line(&self) -> String {
        format!("{} {}\r\n", self.code, self.text)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Parse a PORT argument `h1,h2,h3,h4,p1,p2`.
///
/// Exactly six comma separated decimal octets; anything else is rejected.
pub fn parse_port(arg: &str) -> Result<SocketAddrV4, FtpError> {
    let parts: Vec<&str> = arg.split(',').map(str::trim).collect();
    if parts.len() != 6 {
        return Err(FtpError::InvalidPort);
    }

    let mut octets = [0u8; 6];
    for (slot, part) in octets.iter_mut().zip(&parts) {
        *slot = part.parse().map_err(|_| FtpError::InvalidPort)?;
    }

    let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
    let port = u16::from(octets[4]) << 8 | u16::from(octets[5]);
    Ok(SocketAddrV4::new(ip, port))
}

/// RFC 959 host/port encoding used in the 227 reply
pub fn format_pasv(addr: SocketAddrV4) -> String {
    let [h1, h2, h3, h4] = addr.ip().octets();
    let port = addr.port();
    format!("{},{},{},{},{},{}", h1, h2, h3, h4, port >> 8, port & 0xff)
}

/// Resolve `arg` against the session directory. Absolute paths win.
pub fn resolve_path(cwd: &str, arg: &str) -> String {
    if arg.is_empty() {
        return cwd.to_string();
    }
    if arg.starts_with('/') {
        return arg.to_string();
    }
    format!("{}/{}", cwd.trim_end_matches('/'), arg)
}

/// One path segment up; the root is its own parent
pub fn parent_dir(cwd: &str) -> String {
    let trimmed = cwd.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}
