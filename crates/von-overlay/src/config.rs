//! Peer configuration.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use von_geometry::{BoundingBox, VoronoiConfig};

/// Tunables of one overlay peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    /// Extra radius added to every AOI when testing for overlap
    pub aoi_buffer: f64,

    /// Factor applied to `aoi_buffer` when deciding to drop a neighbor,
    /// so a dropped node is not rediscovered right away
    pub nonoverlap_multiplier: f64,

    /// Period of the maintenance tick
    pub tick_interval: Duration,

    /// How long a neighbor may stay irrelevant before it is dropped
    pub drop_grace: Duration,

    /// Minimum time between two pruning passes
    pub prune_interval: Duration,

    /// Test overlap against the whole cell instead of the site position
    pub overlap_accurate: bool,

    /// Seed for collision perturbation (random when unset)
    pub rng_seed: Option<u64>,

    /// Geometry engine settings
    pub voronoi: VoronoiConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            aoi_buffer: 32.0,
            nonoverlap_multiplier: 1.25,
            tick_interval: Duration::from_millis(100),
            drop_grace: Duration::from_secs(2),
            prune_interval: Duration::from_secs(1),
            overlap_accurate: false,
            rng_seed: None,
            voronoi: VoronoiConfig::default(),
        }
    }
}

impl PeerConfig {
    /// Create config from environment variables with sensible defaults.
    ///
    /// Reads `VON_AOI_BUFFER`, `VON_NONOVERLAP_MULTIPLIER`, `VON_TICK_MS`,
    /// `VON_DROP_GRACE_MS`, `VON_PRUNE_INTERVAL_MS`, `VON_OVERLAP_ACCURATE`
    /// and `VON_WORLD_SIZE`. Malformed values are reported and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PeerConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = parse_distance(&lookup, "VON_AOI_BUFFER") {
            cfg.aoi_buffer = v;
        }
        if let Some(v) = parse_distance(&lookup, "VON_NONOVERLAP_MULTIPLIER") {
            cfg.nonoverlap_multiplier = v;
        }
        if let Some(ms) = parse(&lookup, "VON_TICK_MS") {
            cfg.tick_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "VON_DROP_GRACE_MS") {
            cfg.drop_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "VON_PRUNE_INTERVAL_MS") {
            cfg.prune_interval = Duration::from_millis(ms);
        }
        if let Some(v) = parse(&lookup, "VON_OVERLAP_ACCURATE") {
            cfg.overlap_accurate = v;
        }
        if let Some(size) = parse::<f64>(&lookup, "VON_WORLD_SIZE") {
            if size.is_finite() && size > 0.0 {
                cfg.voronoi.bbox = BoundingBox::square(size);
            } else {
                warn!("ignoring VON_WORLD_SIZE={}: not a positive size", size);
            }
        }

        if cfg.tick_interval.is_zero() {
            warn!("tick interval of zero, using default");
            cfg.tick_interval = Self::default().tick_interval;
        }

        cfg
    }

    /// Buffer used when deciding whether to drop a neighbor.
    pub fn drop_buffer(&self) -> f64 {
        self.aoi_buffer * self.nonoverlap_multiplier
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

/// A finite, non-negative float.
fn parse_distance(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<f64> {
    let v = parse::<f64>(lookup, key)?;
    if v.is_finite() && v >= 0.0 {
        Some(v)
    } else {
        warn!("ignoring {}={}: not a finite non-negative value", key, v);
        None
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
    fn defaults() {
        let cfg = PeerConfig::default();
        assert_eq!(cfg.aoi_buffer, 32.0);
        assert_eq!(cfg.drop_buffer(), 40.0);
        assert_eq!(cfg.tick_interval, Duration::from_millis(100));
        assert_eq!(cfg.drop_grace, Duration::from_secs(2));
    }

    #[test]
    fn env_overrides() {
        let cfg = PeerConfig::from_lookup(lookup(&[
            ("VON_AOI_BUFFER", "10"),
            ("VON_TICK_MS", " 250 "),
            ("VON_OVERLAP_ACCURATE", "true"),
            ("VON_WORLD_SIZE", "5000"),
        ]));
        assert_eq!(cfg.aoi_buffer, 10.0);
        assert_eq!(cfg.tick_interval, Duration::from_millis(250));
        assert!(cfg.overlap_accurate);
        assert_eq!(cfg.voronoi.bbox, BoundingBox::square(5000.0));
    }

    #[test]
    fn malformed_values_fall_back() {
        let cfg = PeerConfig::from_lookup(lookup(&[
            ("VON_AOI_BUFFER", "lots"),
            ("VON_TICK_MS", "0"),
            ("VON_WORLD_SIZE", "-3"),
        ]));
        let default = PeerConfig::default();
        assert_eq!(cfg.aoi_buffer, default.aoi_buffer);
        assert_eq!(cfg.tick_interval, default.tick_interval);
        assert_eq!(cfg.voronoi.bbox, default.voronoi.bbox);
    }

    #[test]
    fn buffers_must_be_finite_and_non_negative() {
        let default = PeerConfig::default();
        for bad in ["NaN", "inf", "-4"] {
            let cfg = PeerConfig::from_lookup(lookup(&[
                ("VON_AOI_BUFFER", bad),
                ("VON_NONOVERLAP_MULTIPLIER", bad),
            ]));
            assert_eq!(cfg.aoi_buffer, default.aoi_buffer, "buffer {}", bad);
            assert_eq!(cfg.nonoverlap_multiplier, default.nonoverlap_multiplier);
        }

        let cfg = PeerConfig::from_lookup(lookup(&[
            ("VON_AOI_BUFFER", "0"),
            ("VON_NONOVERLAP_MULTIPLIER", "2"),
        ]));
        assert_eq!(cfg.aoi_buffer, 0.0);
        assert_eq!(cfg.nonoverlap_multiplier, 2.0);
    }
}
