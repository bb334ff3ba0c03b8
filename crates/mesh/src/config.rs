//! Runtime configuration for the mesh core

use std::env;

/// Tunables for the router, caches, and background sweepers.
///
/// `Default` carries the protocol defaults; `from_env` lets a deployment
/// override individual knobs without a config file.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub max_hops: u8,
    pub announce_interval_secs: u64,
    pub seen_cache_capacity: usize,
    pub seen_cache_max_age_secs: u64,
    pub seen_sweep_interval_secs: u64,
    /// Undelivered messages older than this are not replayed.
    pub replay_window_hours: i64,
    /// Messages older than this are purged by the retention sweep.
    pub retention_days: i64,
    pub retention_sweep_interval_secs: u64,
    /// Peers unseen for this long are marked LOST.
    pub stale_peer_timeout_secs: i64,
    pub stale_peer_sweep_interval_secs: u64,
    pub direct_ip_listen_addr: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_hops: protocol::DEFAULT_MAX_HOPS,
            announce_interval_secs: 60,
            seen_cache_capacity: 10_000,
            seen_cache_max_age_secs: 3600,
            seen_sweep_interval_secs: 300,
            replay_window_hours: 24,
            retention_days: 30,
            retention_sweep_interval_secs: 3600,
            stale_peer_timeout_secs: 1800,
            stale_peer_sweep_interval_secs: 300,
            direct_ip_listen_addr: "0.0.0.0:47474".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl MeshConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_hops: env_parse("MESH_MAX_HOPS", defaults.max_hops),
            announce_interval_secs: env_parse(
                "MESH_ANNOUNCE_INTERVAL_SECS",
                defaults.announce_interval_secs,
            ),
            seen_cache_capacity: env_parse("MESH_SEEN_CACHE_CAPACITY", defaults.seen_cache_capacity),
            seen_cache_max_age_secs: env_parse(
                "MESH_SEEN_CACHE_MAX_AGE_SECS",
                defaults.seen_cache_max_age_secs,
            ),
            seen_sweep_interval_secs: env_parse(
                "MESH_SEEN_SWEEP_INTERVAL_SECS",
                defaults.seen_sweep_interval_secs,
            ),
            replay_window_hours: env_parse("MESH_REPLAY_WINDOW_HOURS", defaults.replay_window_hours),
            retention_days: env_parse("MESH_RETENTION_DAYS", defaults.retention_days),
            retention_sweep_interval_secs: env_parse(
                "MESH_RETENTION_SWEEP_INTERVAL_SECS",
                defaults.retention_sweep_interval_secs,
            ),
            stale_peer_timeout_secs: env_parse(
                "MESH_STALE_PEER_TIMEOUT_SECS",
                defaults.stale_peer_timeout_secs,
            ),
            stale_peer_sweep_interval_secs: env_parse(
                "MESH_STALE_PEER_SWEEP_INTERVAL_SECS",
                defaults.stale_peer_sweep_interval_secs,
            ),
            direct_ip_listen_addr: env::var("MESH_DIRECT_IP_LISTEN_ADDR")
                .unwrap_or(defaults.direct_ip_listen_addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol() {
        let config = MeshConfig::default();
        assert_eq!(config.max_hops, 7);
        assert_eq!(config.seen_cache_capacity, 10_000);
        assert_eq!(config.seen_cache_max_age_secs, 3600);
        assert_eq!(config.announce_interval_secs, 60);
    }
}
