use anyhow::{Context, Result};
use dotenv::dotenv;
use log::{error, info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use p2p_fs::catalog::FileCatalog;
use p2p_fs::config::NodeConfig;
use p2p_fs::networking::{interface, LocalAddresses, PeerDiscovery, PeerRegistry, TransferClient, TransferServer};
use p2p_fs::shell::{spawn_stdin_reader, Shell};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = NodeConfig::from_env();

    let node_name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());

    let my_ip = interface::get_local_ip()
        .context("Could not get local IP, check network connection")?;
    info!("Starting node for fs-sys on {}... My IP is {}", node_name, my_ip);

    let catalog = Arc::new(
        FileCatalog::open(&config.shared_dir)
            .with_context(|| format!("Could not index {}", config.shared_dir.display()))?,
    );
    let registry = Arc::new(PeerRegistry::new(config.peer_timeout));
    let local_addrs = Arc::new(LocalAddresses::detect(my_ip));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            cancel.cancel();
        })?;
    }

    let mut server = TransferServer::new(config.transfer_config(), catalog.clone());
    server.start_server(cancel.clone()).await?;

    let discovery = PeerDiscovery::new(
        config.discovery_config(),
        registry.clone(),
        local_addrs,
        my_ip,
    );
    let discovery_tasks = discovery.start(cancel.clone()).await?;

    let client = TransferClient::new(config.transfer_port, catalog);
    let shell = Shell::new(registry, client);

    if let Err(e) = shell.run(spawn_stdin_reader(), cancel.clone()).await {
        error!("Command loop failed: {}", e);
        cancel.cancel();
    }

    server.stop_server().await;
    for task in discovery_tasks {
        if let Err(e) = task.await {
            warn!("Discovery task ended abnormally: {}", e);
        }
    }

    info!("Node stopped");
    Ok(())
}
