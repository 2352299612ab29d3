//! VON node binary
//!
//! Runs one overlay peer over UDP, configured from the environment.

mod config;

use std::sync::Arc;

use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use von_overlay::{Peer, PeerConfig, PeerService, TrafficStats};
use von_transport::{Transport, UdpConfig, UdpTransport};

use crate::config::NodeConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "von_node=info,von_overlay=info,von_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::from_env();
    let peer_config = PeerConfig::from_env();
    info!("Starting VON node: {}", serde_json::to_string(&config)?);

    let udp = UdpConfig {
        bind: config.bind,
        advertise: config.advertise,
        ..UdpConfig::default()
    };
    let (transport, events) = UdpTransport::bind(udp, config.id).await?;
    let gateway = config.gateway.unwrap_or_else(|| transport.local_addr());

    let stats = Arc::new(TrafficStats::new());
    let peer = Peer::with_observer(transport, peer_config, stats.clone());
    let (service, handle) = PeerService::new(peer, events);
    let task = tokio::spawn(service.run());

    info!("Joining through {} at {}", gateway, config.aoi());
    tokio::select! {
        joined = handle.join(gateway, config.aoi()) => {
            info!("Joined overlay as [{}]", joined?);
        }
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            info!("Interrupted before join completed");
            handle.shutdown().await?;
            task.await?;
            return Ok(());
        }
    }

    let mut status = tokio::time::interval(config.status_interval);
    loop {
        tokio::select! {
            _ = status.tick() => {
                let snapshot = handle.status().await?;
                info!("Status: {}", serde_json::to_string(&snapshot)?);
                debug!("Traffic: {}", serde_json::to_string(&stats.snapshot())?);
            }
            interrupted = tokio::signal::ctrl_c() => {
                interrupted?;
                info!("Interrupted, leaving overlay");
                break;
            }
        }
    }

    handle.shutdown().await?;
    task.await?;

    Ok(())
}
