//! Replica and server configuration.
//!
//! The peer list is fixed for the life of the process: index `me` in the
//! ordered address list is this peer.
//!
//! Peers file format (one address per line, `#` comments):
//! ```text
//! # pad cluster
//! 10.0.0.1:7000
//! 10.0.0.2:7000
//! 10.0.0.3:7000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use pad_paxos::{PaxosConfig, PeerId};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read peers file {path}: {source}")]
    PeersFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Peer list is empty")]
    NoPeers,

    #[error("Peer index {me} is out of range for {peers} peers")]
    BadIndex { me: PeerId, peers: usize },
}

/// Log driver tuning.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Sleep between polls of an undecided next slot
    pub apply_poll: Duration,
    /// First wait while polling a proposed slot
    pub decide_wait_initial: Duration,
    /// Ceiling of the doubling wait
    pub decide_wait_max: Duration,
    /// Unsuccessful polls before a no-op is proposed for the slot
    pub noop_after: u32,
    /// A commit resubmitted within this many slots of its first application
    /// is dropped as a duplicate
    pub dedup_window: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            apply_poll: Duration::from_millis(50),
            decide_wait_initial: Duration::from_millis(10),
            decide_wait_max: Duration::from_secs(10),
            noop_after: 7,
            dedup_window: 100_000,
        }
    }
}

impl ReplicaConfig {
    /// Tight polling for in-process clusters.
    pub fn for_testing() -> Self {
        Self {
            apply_poll: Duration::from_millis(2),
            decide_wait_initial: Duration::from_millis(2),
            decide_wait_max: Duration::from_millis(100),
            noop_after: 7,
            dedup_window: 1_000,
        }
    }

    /// Wait before poll number `attempt` (0-based) of a proposed slot.
    pub fn decide_wait(&self, attempt: u32) -> Duration {
        self.decide_wait_initial
            .saturating_mul(1u32 << attempt.min(20))
            .min(self.decide_wait_max)
    }
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Ordered peer addresses (consensus RPC endpoints)
    pub peers: Vec<String>,
    /// Index of this peer in `peers`
    pub me: PeerId,
    /// Document store directory (None = in-memory only)
    pub data_dir: Option<PathBuf>,
    /// How often changed documents are written to the store
    pub persist_interval: Duration,
    /// Upper bound on the startup wait for peer syncs
    pub sync_timeout: Duration,
    pub paxos: PaxosConfig,
    pub replica: ReplicaConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            peers: vec!["127.0.0.1:7000".to_string()],
            me: 0,
            data_dir: None,
            persist_interval: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(60),
            paxos: PaxosConfig::default(),
            replica: ReplicaConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Short timers everywhere; no persistence unless `data_dir` is set.
    pub fn for_testing(peers: Vec<String>, me: PeerId) -> Self {
        Self {
            peers,
            me,
            data_dir: None,
            persist_interval: Duration::from_millis(50),
            sync_timeout: Duration::from_secs(10),
            paxos: PaxosConfig::for_testing(),
            replica: ReplicaConfig::for_testing(),
        }
    }

    /// Load the peer list from `path` and take index `me`.
    pub fn from_peers_file(path: impl AsRef<Path>, me: PeerId) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::PeersFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self {
            peers: parse_peers(&contents),
            me,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.is_empty() {
            return Err(ConfigError::NoPeers);
        }
        if self.me >= self.peers.len() {
            return Err(ConfigError::BadIndex {
                me: self.me,
                peers: self.peers.len(),
            });
        }
        Ok(())
    }

    /// This peer's own listen address.
    pub fn listen_addr(&self) -> Result<&str, ConfigError> {
        self.validate()?;
        Ok(&self.peers[self.me])
    }
}

fn parse_peers(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.persist_interval, Duration::from_secs(5));
        assert!(config.data_dir.is_none());
        assert_eq!(config.replica.noop_after, 7);
        assert_eq!(config.replica.dedup_window, 100_000);
    }

    #[test]
    fn test_decide_wait_doubles_and_caps() {
        let config = ReplicaConfig::default();
        assert_eq!(config.decide_wait(0), Duration::from_millis(10));
        assert_eq!(config.decide_wait(1), Duration::from_millis(20));
        assert_eq!(config.decide_wait(3), Duration::from_millis(80));
        assert_eq!(config.decide_wait(10), Duration::from_secs(10));
        assert_eq!(config.decide_wait(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_peers_skips_comments() {
        let peers = parse_peers("# cluster\n\n a:1 \nb:2\n# c:3\n");
        assert_eq!(peers, vec!["a:1", "b:2"]);
    }

    #[test]
    fn test_from_peers_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "127.0.0.1:7001\n127.0.0.1:7002\n127.0.0.1:7003").unwrap();

        let config = ServerConfig::from_peers_file(file.path(), 1).unwrap();
        assert_eq!(config.peers.len(), 3);
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:7002");

        let err = ServerConfig::from_peers_file(file.path(), 3).unwrap_err();
        assert!(matches!(err, ConfigError::BadIndex { me: 3, peers: 3 }));
    }

    #[test]
    fn test_missing_peers_file() {
        let err = ServerConfig::from_peers_file("/nonexistent/peers.txt", 0).unwrap_err();
        assert!(matches!(err, ConfigError::PeersFile { .. }));
        assert!(matches!(
            ServerConfig::for_testing(Vec::new(), 0).validate(),
            Err(ConfigError::NoPeers)
        ));
    }
}
