//! Local port forwarding through SSH.

mod manager;

pub use manager::{TunnelConfig, TunnelManager, TunnelState, TunnelStats};

use crate::registry::Registry;

/// Registry key of the Transmission RPC forward
pub const RPC_TUNNEL_KEY: &str = "transmission-rpc";

/// Keyed store of running tunnels
pub type TunnelRegistry = Registry<TunnelManager>;
