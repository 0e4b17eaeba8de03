pub mod auth;
pub mod connection;
pub mod handler;

pub use auth::{ResolvedAuth, decode_private_key};
pub use connection::{
    DirectChannel, RelayStream, RusshConnector, SshConnection, SshConnector, SshTransport,
};
pub use handler::{ClientHandler, HostKeyPolicy};
