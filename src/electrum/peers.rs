//! Electrum server endpoints: the static fallback list and user-supplied nodes

use std::fmt;

use bitcoin::Network;
use serde::{Deserialize, Serialize};

/// Port assumed when a custom node omits one
pub const DEFAULT_PORT: u16 = 50001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Tls,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Tls => write!(f, "tls"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
}

impl Peer {
    pub fn new(host: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, Transport::Tcp)
    }

    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, Transport::Tls)
    }

    /// `host:port` as handed to the socket layer
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.transport)
    }
}

/// Ordered fallback peers for a network. Tried front to back.
pub fn default_peers(network: Network) -> Vec<Peer> {
    match network {
        Network::Bitcoin => vec![
            Peer::tcp("electrum.blockstream.info", 50001),
            Peer::tcp("electrum.emzy.de", 50001),
        ],
        Network::Testnet => vec![
            Peer::tcp("testnet.qtornado.com", 51001),
            Peer::tcp("electrum.blockstream.info", 60001),
            Peer::tls("testnet.qtornado.com", 51002),
            Peer::tls("electrum.blockstream.info", 60002),
        ],
        // No public servers worth hardcoding; these need a custom node
        _ => Vec::new(),
    }
}

/// Parse a `host[:port[:protocol]]` node string.
///
/// A leading `http://` or `https://` is tolerated and stripped. Port defaults
/// to 50001 and protocol to tcp.
pub fn parse_custom_node(raw: &str) -> Result<Peer, String> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/');

    let mut parts = stripped.split(':');
    let host = parts.next().unwrap_or_default().trim();
    if host.is_empty() {
        return Err(format!("missing host in '{}'", raw));
    }

    let port = match parts.next().map(str::trim) {
        None | Some("") => DEFAULT_PORT,
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| format!("invalid port '{}' in '{}'", p, raw))?,
    };

    let transport = match parts.next().map(|p| p.trim().to_lowercase()) {
        None => Transport::Tcp,
        Some(p) if p.is_empty() || p == "tcp" => Transport::Tcp,
        Some(p) if p == "tls" || p == "ssl" => Transport::Tls,
        Some(p) => return Err(format!("unknown protocol '{}' in '{}'", p, raw)),
    };

    if parts.next().is_some() {
        return Err(format!("too many ':' separated parts in '{}'", raw));
    }

    Ok(Peer::new(host, port, transport))
}
