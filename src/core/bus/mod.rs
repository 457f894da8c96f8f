// src/core/bus/mod.rs

//! The cluster bus transport: TCP listener for inbound links and the
//! per-link machinery in [`link`].

pub mod link;

pub use link::{LinkHandle, MsgBlock, establish_link};

use crate::core::state::Cluster;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Accept loop for the bus listener. Every accepted connection becomes an
/// inbound link that is attached to a node once its first packet names the
/// sender.
pub async fn run(cluster: Arc<Cluster>, mut shutdown_rx: broadcast::Receiver<()>) {
    let port = match cluster.config.bus_port() {
        Ok(port) => port,
        Err(e) => {
            error!("Cannot start cluster bus listener: {e}");
            return;
        }
    };
    let addr = format!("{}:{}", cluster.config.host, port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind cluster bus on {addr}: {e}");
            return;
        }
    };
    info!("Cluster bus listening on {addr}");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Cluster bus listener shutting down.");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted cluster bus connection from {peer}");
                    link::establish_link(&cluster, stream, None, true);
                }
                Err(e) => error!("Error accepting cluster bus connection: {e}"),
            }
        }
    }
}
