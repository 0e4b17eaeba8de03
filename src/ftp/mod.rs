//! Anonymous FTP front-end for the SFTP sub-session, so media players that
//! only speak FTP can stream remote files.

pub mod command;
mod gateway;
mod session;

pub use gateway::{FtpGateway, GatewayStatus};
pub use session::{FtpSession, TRANSFER_CHUNK};

use crate::registry::Registry;

/// Registry key of the browse gateway
pub const GATEWAY_KEY: &str = "sftp-ftp";

/// Keyed store of running gateways
pub type FtpGatewayRegistry = Registry<FtpGateway>;
