//! Fleet Query Server
//!
//! Standalone query listener. Loads `QueryConfig` from the path given as the
//! first argument or in `FLEETQUERY_CONFIG`, applies environment overrides,
//! and serves until interrupted.

use std::sync::Arc;
use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleet_query::protocol::legacy::PluginEntry;
use fleet_query::{
    ChallengeCodec, LocalServer, NetworkModule, QueryConfig, QueryDispatcher, QueryServer,
    ServerIdentity, VERSION,
};

#[cfg(feature = "debug-tracing")]
const DEFAULT_FILTER: &str = "debug";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Fleet Query Server v{}", VERSION);

    let config = load_config()?;
    let bind_addr = config.bind_addr().context("invalid bind address")?;

    let identity = ServerIdentity::default().with_overrides(&config.server_info);
    let local = Arc::new(LocalServer::new(identity).with_plugins(vec![PluginEntry {
        id: env!("CARGO_PKG_NAME").to_string(),
        version: VERSION.to_string(),
        enabled: true,
    }]));

    let network = if config.network.enabled {
        let module = Arc::new(NetworkModule::new(config.network.clone(), local.clone()));
        match module.start().await {
            Ok(()) => {
                info!(
                    "Network module running: server {} in network {} ({})",
                    module.server_id(),
                    module.network_id(),
                    module.mode()
                );
                Some(module)
            }
            Err(e) => {
                error!("Network module unavailable, answering with local data only: {}", e);
                None
            }
        }
    } else {
        None
    };

    let server = if config.enabled {
        let challenges = ChallengeCodec::random().context("challenge secret")?;
        let dispatcher =
            QueryDispatcher::from_config(&config, challenges, local.clone(), network.clone());
        Some(Arc::new(QueryServer::new(Arc::new(dispatcher))))
    } else {
        warn!("Query listener disabled by configuration");
        None
    };

    let serving = server.clone().map(|server| {
        tokio::spawn(async move { server.run(bind_addr).await })
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    if let Some(server) = &server {
        server.shutdown();
    }
    if let Some(task) = serving {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Query server failed: {}", e),
            Err(e) => error!("Query server task panicked: {}", e),
        }
    }
    if let Some(network) = network {
        network.stop().await;
    }

    Ok(())
}

fn load_config() -> anyhow::Result<QueryConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FLEETQUERY_CONFIG").ok());

    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from {}", path);
            QueryConfig::from_file(&path).with_context(|| format!("loading {}", path))?
        }
        None => {
            info!("No configuration file given, using defaults");
            QueryConfig::default()
        }
    };
    config.apply_env();
    Ok(config)
}
