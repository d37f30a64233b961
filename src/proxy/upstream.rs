//! The single upstream the gateway forwards to.

use std::net::SocketAddr;

use pingora_core::upstreams::peer::HttpPeer;

/// Upstream origin: address, TLS flag and SNI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub addr: SocketAddr,
    pub tls: bool,
    pub sni: String,
}

impl Upstream {
    /// Builds an upstream from an `IP:PORT` address.
    ///
    /// An empty `sni` falls back to the address IP.
    pub fn new(address: &str, tls: bool, sni: &str) -> Result<Self, String> {
        let addr = parse_backend_address(address)?;
        let sni = if sni.is_empty() {
            addr.ip().to_string()
        } else {
            sni.to_string()
        };
        Ok(Self { addr, tls, sni })
    }

    /// `IP:PORT` authority for side requests to the same origin.
    pub fn authority(&self) -> String {
        self.addr.to_string()
    }

    pub fn to_peer(&self) -> HttpPeer {
        HttpPeer::new(self.addr, self.tls, self.sni.clone())
    }
}

/// Parses a backend address string into a SocketAddr.
///
/// Expects format "IP:PORT" (e.g., "192.168.1.1:8080" or "[::1]:8080").
pub fn parse_backend_address(address: &str) -> Result<SocketAddr, String> {
    address
        .parse::<SocketAddr>()
        .map_err(|e| format!("invalid backend address '{}': {}", address, e))
}
