//! Publishing service ports on the host
//!
//! The engine runs a small TCP forwarder per exposed port, listening on
//! loopback and relaying to the service's sandbox address.

use crate::error::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Host port chosen for an exposed service port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortMapping {
    /// Same number as the service port
    #[default]
    Identity,
    Explicit { host_port: u16 },
    /// Any free port
    Random,
}

impl PortMapping {
    pub fn host_port(&self, service_port: u16) -> u16 {
        match self {
            Self::Identity => service_port,
            Self::Explicit { host_port } => *host_port,
            Self::Random => 0,
        }
    }
}

/// An active port exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub service_port: u16,
    pub host: SocketAddr,
}

/// Listen on loopback and relay every connection to `target`
///
/// The returned task owns the listener and every relayed connection;
/// aborting it releases the port and closes them.
pub async fn forward(
    hostname: &str,
    service_port: u16,
    mapping: PortMapping,
    target: SocketAddr,
) -> KilnResult<(PortBinding, JoinHandle<()>)> {
    let listen = SocketAddr::from((Ipv4Addr::LOCALHOST, mapping.host_port(service_port)));
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| KilnError::PortExposure {
            hostname: hostname.to_string(),
            port: service_port,
            reason: format!("cannot listen on {}: {}", listen, e),
        })?;
    let host = listener
        .local_addr()
        .map_err(|e| KilnError::io("reading forwarder address", e))?;

    debug!("Forwarding {} -> {} ({})", host, target, hostname);
    let task = tokio::spawn(async move {
        // Dropped with the task, which aborts every open connection
        let mut relays = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((inbound, peer)) => {
                        relays.spawn(relay(inbound, peer, target));
                    }
                    Err(e) => {
                        warn!("Forwarder on {} stopped: {}", host, e);
                        return;
                    }
                },
                Some(_) = relays.join_next() => {}
            }
        }
    });

    Ok((PortBinding { service_port, host }, task))
}

async fn relay(mut inbound: TcpStream, peer: SocketAddr, target: SocketAddr) {
    let mut outbound = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Forward from {} to {} failed: {}", peer, target, e);
            return;
        }
    };
    if let Err(e) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        debug!("Connection {} -> {} closed: {}", peer, target, e);
    }
}
