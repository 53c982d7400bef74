// vidswarm - config.rs

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;

pub const DEFAULT_CONTROL_PORT: u16 = 47101;
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(230, 71, 47, 1);
pub const DEFAULT_MULTICAST_PORT: u16 = 47100;

/// Static settings for one node. Everything here is fixed for the life of the process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub peer_name: String,
    pub control_port: u16,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    /// Hop limit for announcements. 1 keeps them on the local segment.
    pub multicast_ttl: u32,
    pub announce_interval_ms: u64,
    pub catalog_timeout_ms: u64,
    pub chunk_timeout_ms: u64,
    /// Contiguous chunks from the start of the file needed before playback can begin.
    pub play_threshold_chunks: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_name: default_peer_name(),
            control_port: DEFAULT_CONTROL_PORT,
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_port: DEFAULT_MULTICAST_PORT,
            multicast_ttl: 1,
            announce_interval_ms: 5000,
            catalog_timeout_ms: 2500,
            chunk_timeout_ms: 4000,
            play_threshold_chunks: 8,
        }
    }
}

impl NodeConfig {
    /// Defaults, then the optional TOML file at `path`, then `VIDSWARM_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<NodeConfig, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(ConfigFile::from(path).required(false));
        }
        builder
            .add_source(Environment::with_prefix("VIDSWARM"))
            .build()?
            .try_deserialize::<NodeConfig>()
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms.max(1))
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_millis(self.catalog_timeout_ms)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

fn default_peer_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "Peer".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = NodeConfig::default();
        assert_eq!(config.control_port, 47101);
        assert_eq!(config.multicast_group, Ipv4Addr::new(230, 71, 47, 1));
        assert_eq!(config.multicast_port, 47100);
        assert_eq!(config.multicast_ttl, 1);
        assert_eq!(config.announce_interval(), Duration::from_secs(5));
        assert_eq!(config.play_threshold_chunks, 8);
        assert!(!config.peer_name.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "peer_name = \"den\"\ncontrol_port = 50000\nmulticast_group = \"239.1.2.3\"").unwrap();

        let config = NodeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.peer_name, "den");
        assert_eq!(config.control_port, 50000);
        assert_eq!(config.multicast_group, Ipv4Addr::new(239, 1, 2, 3));
        assert_eq!(config.multicast_port, DEFAULT_MULTICAST_PORT);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = NodeConfig::load(Some(Path::new("/nonexistent/vidswarm.toml"))).unwrap();
        assert_eq!(config.control_port, DEFAULT_CONTROL_PORT);
    }
}
