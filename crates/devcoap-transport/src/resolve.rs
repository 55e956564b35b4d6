//! Host name resolution

use std::net::SocketAddr;
use tokio::net::lookup_host;
use tracing::{debug, error};

use crate::error::{Result, TransportError};

/// Resolve a textual host (name, IPv4 or IPv6 literal) to a socket address.
///
/// The first address returned by the resolver is used, whatever its family.
pub async fn resolve_address(host: &str, port: u16) -> Result<SocketAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut addrs = lookup_host((host, port)).await.map_err(|e| {
        error!("failed to resolve address {}: {}", host, e);
        TransportError::AddressResolution(host.to_string())
    })?;

    let addr = addrs.next().ok_or_else(|| {
        error!("no address found for {}", host);
        TransportError::AddressResolution(host.to_string())
    })?;
    debug!("resolved {} to {}", host, addr);
    Ok(addr)
}
