//! Node configuration: command-line flags, protocol constants, peer file.

use std::path::Path;
use std::time::Duration;

use clap::Parser;

use crate::error::NodeError;

/// Reward credited to the miner of every accepted block.
pub const BLOCK_REWARD: f64 = 1.0;

/// Required count of leading zero hash bytes for blocks carrying at least
/// one transaction or registration.
pub const BLOCK_DIFF: u8 = 1;

/// Required count of leading zero hash bytes for blocks with no payload.
/// Harder than [`BLOCK_DIFF`] so idle miners produce fewer throwaway blocks.
pub const EMPTY_BLOCK_DIFF: u8 = 2;

/// Upper bound on the number of blocks returned in a single sync reply.
pub const MAX_SYNC_BLOCKS: usize = 1000;

/// How long a sync slot stays reserved before a missing reply is given up on.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between chain snapshots written to disk.
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of mining worker threads.
pub const DEFAULT_MINING_THREADS: usize = 4;

/// Path of the persisted wallet.
pub const WALLET_FILE: &str = "wallet.json";

/// Path of the persisted chain snapshot.
pub const CHAIN_FILE: &str = "blockchain.json";

#[derive(Debug, Clone, Parser)]
#[command(name = "sjcoin", version, about = "Peer-to-peer proof-of-work currency node")]
pub struct NodeConfig {
    /// Accept inbound peer connections on the relay port.
    #[arg(long = "relay-enable", default_value_t = false)]
    pub relay_enable: bool,

    /// TCP port for inbound peer connections.
    #[arg(long = "relay-port", default_value = "10505")]
    pub relay_port: String,

    /// Path to a JSON array of "host:port" peers to dial.
    #[arg(long = "peer-file", default_value = "peers.json")]
    pub peer_file: String,

    /// Mine blocks over the floating mempool.
    #[arg(long = "miner-enable", default_value_t = false)]
    pub miner_enable: bool,

    /// Do not rebroadcast blocks, transactions or registrations received
    /// from peers.
    #[arg(long, default_value_t = false)]
    pub local: bool,

    /// Number of mining worker threads.
    #[arg(long = "mining-threads", default_value_t = DEFAULT_MINING_THREADS)]
    pub mining_threads: usize,
}

/// Reads the peer list. A missing file is treated as an empty peer list so a
/// fresh node can start without one; a present but malformed file is an
/// error, since silently dialing nobody would look like a healthy start.
pub fn load_peer_file(path: &str) -> Result<Vec<String>, NodeError> {
    if !Path::new(path).exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let peers: Vec<String> = serde_json::from_str(&content)
        .map_err(|e| NodeError::Config(format!("malformed peer file {}: {}", path, e)))?;
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_peer_file_is_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let peers = load_peer_file(path.to_str().unwrap()).unwrap();
        assert!(peers.is_empty());
    }

    #[test]
    fn reads_peer_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, r#"["10.0.0.1:10505", "10.0.0.2:10505"]"#).unwrap();

        let peers = load_peer_file(path.to_str().unwrap()).unwrap();
        assert_eq!(peers, vec!["10.0.0.1:10505", "10.0.0.2:10505"]);
    }

    #[test]
    fn malformed_peer_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(load_peer_file(path.to_str().unwrap()).is_err());
    }
}
