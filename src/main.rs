use std::sync::Arc;

use anyhow::{Context, Result};

use throttle_bridge::bridge::{Bridge, TracingNotifier};
use throttle_bridge::config::{AppConfig, ServersConfig, paths};
use throttle_bridge::mount::TokioCommandRunner;
use throttle_bridge::secrets::SecretStore;
use throttle_bridge::ssh::RusshConnector;

struct Args {
    server: Option<String>,
    verbose: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        server: None,
        verbose: false,
    };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-v" | "--verbose" => args.verbose = true,
            "-h" | "--help" => {
                println!("usage: throttle-bridge [-v] [server-name]");
                std::process::exit(0);
            }
            flag if flag.starts_with('-') => anyhow::bail!("unknown option {}", flag),
            name if args.server.is_none() => args.server = Some(name.to_string()),
            extra => anyhow::bail!("unexpected argument {}", extra),
        }
    }
    Ok(args)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn secret_store() -> Arc<dyn SecretStore> {
    Arc::new(throttle_bridge::secrets::KeyringSecretStore::new())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn secret_store() -> Arc<dyn SecretStore> {
    tracing::warn!("No keychain backend on this platform; credentials are kept in memory");
    Arc::new(throttle_bridge::secrets::MemorySecretStore::new())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    let log_dir = paths::ensure_log_dir().ok();
    let _guard = throttle_bridge::logging::init_logging(log_dir, args.verbose);

    tracing::info!("Starting throttle-bridge {}", env!("CARGO_PKG_VERSION"));
    if let Some(dir) = paths::log_dir() {
        tracing::info!("Logging to {}", dir.display());
    }

    let config = AppConfig::load().context("loading config.toml")?;
    let servers = ServersConfig::load().context("loading servers.toml")?;

    let server = match &args.server {
        Some(name) => servers.require(name)?.clone(),
        None => servers
            .default_server()
            .cloned()
            .context("no servers configured; add one to servers.toml")?,
    };

    let secrets = secret_store();
    let connector = Arc::new(RusshConnector::new(
        secrets.clone(),
        config.secrets.service.clone(),
        config.ssh.clone(),
    ));
    let bridge = Bridge::new(
        config,
        secrets,
        connector,
        Arc::new(TokioCommandRunner),
        Arc::new(TracingNotifier),
    );

    let selection = bridge.select_server(server).await;
    tracing::info!(
        tunnel = ?selection.tunnel,
        gateway = ?selection.gateway,
        mount = ?selection.mount,
        "Server selected"
    );
    if let Some(endpoint) = bridge.rpc_endpoint().await {
        tracing::info!("Transmission RPC at {}", endpoint);
    }
    if let Some(addr) = bridge.gateway_addr().await {
        tracing::info!("FTP gateway at ftp://{}", addr);
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");
    bridge.shutdown().await;
    Ok(())
}
