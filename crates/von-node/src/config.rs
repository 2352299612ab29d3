//! Node settings read from the environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;
use von_geometry::Position;
use von_overlay::Aoi;
use von_transport::{PeerId, DEFAULT_PORT, ID_UNASSIGNED};

/// Where the node listens, where it joins and where it stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeConfig {
    /// UDP bind address
    pub bind: SocketAddr,
    /// Address announced to other peers
    pub advertise: Option<SocketAddr>,
    /// Gateway to join through; `None` makes this node the gateway
    pub gateway: Option<SocketAddr>,
    /// Initial AOI center
    pub x: f64,
    pub y: f64,
    /// Initial AOI radius
    pub radius: f64,
    /// Preassigned id, or unassigned to ask the gateway
    pub id: PeerId,
    /// Period of the status log line
    pub status_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            advertise: None,
            gateway: None,
            x: 500.0,
            y: 500.0,
            radius: 100.0,
            id: ID_UNASSIGNED,
            status_interval: Duration::from_secs(10),
        }
    }
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    ///
    /// Reads `VON_BIND`, `VON_ADVERTISE`, `VON_GATEWAY` (`self` or unset
    /// for a gateway node), `VON_X`, `VON_Y`, `VON_RADIUS`, `VON_ID` and
    /// `VON_STATUS_SECS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`NodeConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(addr) = parse(&lookup, "VON_BIND") {
            cfg.bind = addr;
        }
        cfg.advertise = parse(&lookup, "VON_ADVERTISE");

        cfg.gateway = match lookup("VON_GATEWAY") {
            Some(raw) if raw.trim().is_empty() || raw.trim() == "self" => None,
            Some(_) => parse(&lookup, "VON_GATEWAY"),
            None => None,
        };

        if let Some(x) = parse(&lookup, "VON_X") {
            cfg.x = x;
        }
        if let Some(y) = parse(&lookup, "VON_Y") {
            cfg.y = y;
        }
        if let Some(r) = parse(&lookup, "VON_RADIUS") {
            cfg.radius = r;
        }
        if let Some(id) = parse(&lookup, "VON_ID") {
            cfg.id = id;
        }
        if let Some(secs) = parse::<u64>(&lookup, "VON_STATUS_SECS") {
            if secs == 0 {
                warn!("ignoring VON_STATUS_SECS=0");
            } else {
                cfg.status_interval = Duration::from_secs(secs);
            }
        }

        cfg
    }

    /// The AOI to join with.
    pub fn aoi(&self) -> Aoi {
        Aoi::new(Position::new(self.x, self.y), self.radius)
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring malformed {}={:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_make_a_gateway() {
        let cfg = NodeConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg, NodeConfig::default());
        assert!(cfg.gateway.is_none());
        assert_eq!(cfg.bind.port(), DEFAULT_PORT);
    }

    #[test]
    fn joiner_settings() {
        let cfg = NodeConfig::from_lookup(lookup(&[
            ("VON_BIND", "127.0.0.1:4000"),
            ("VON_GATEWAY", "127.0.0.1:3737"),
            ("VON_X", "12.5"),
            ("VON_Y", "40"),
            ("VON_RADIUS", "75"),
            ("VON_STATUS_SECS", "2"),
        ]));
        assert_eq!(cfg.bind, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(cfg.gateway, Some("127.0.0.1:3737".parse().unwrap()));
        assert_eq!(cfg.aoi(), Aoi::new(Position::new(12.5, 40.0), 75.0));
        assert_eq!(cfg.status_interval, Duration::from_secs(2));
    }

    #[test]
    fn malformed_values_fall_back() {
        let cfg = NodeConfig::from_lookup(lookup(&[
            ("VON_GATEWAY", "self"),
            ("VON_BIND", "nowhere"),
            ("VON_RADIUS", "wide"),
            ("VON_STATUS_SECS", "0"),
        ]));
        assert!(cfg.gateway.is_none());
        assert_eq!(cfg.bind, NodeConfig::default().bind);
        assert_eq!(cfg.radius, 100.0);
        assert_eq!(cfg.status_interval, Duration::from_secs(10));
    }
}
