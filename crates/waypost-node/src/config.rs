//! Node configuration, loaded from TOML.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use waypost_common::IpnAddr;

use crate::NodeError;

fn default_pool_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_ingress_limit() -> u32 {
    64
}

fn default_retx_interval_ms() -> u64 {
    3_000
}

fn default_queue_depth() -> u32 {
    64
}

/// UDP convergence-layer settings: one bundle per datagram.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaConfig {
    /// Local address to receive bundles on.
    pub bind: SocketAddr,
    /// Peer the egress side transmits to.
    pub peer: SocketAddr,
    /// Depth limit for the interface's subqs.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// This node's own endpoint, e.g. `"ipn:10.1"`.
    pub self_eid: IpnAddr,
    /// Bytes of block-pool storage to reserve.
    #[serde(default = "default_pool_bytes")]
    pub pool_bytes: usize,
    /// Depth limit of the storage flow's ingress subq.
    #[serde(default = "default_ingress_limit")]
    pub ingress_limit: u32,
    /// Retransmit interval while waiting for custody acknowledgements.
    #[serde(default = "default_retx_interval_ms")]
    pub retx_interval_ms: u64,
    /// Directory for the persistent offload backend; in-memory only if unset.
    #[serde(default)]
    pub offload_dir: Option<PathBuf>,
    /// UDP convergence layer; loopback-only node if unset.
    #[serde(default)]
    pub cla: Option<ClaConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, NodeError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| NodeError::Config(err.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            self_eid: IpnAddr::NULL,
            pool_bytes: default_pool_bytes(),
            ingress_limit: default_ingress_limit(),
            retx_interval_ms: default_retx_interval_ms(),
            offload_dir: None,
            cla: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let text = r#"
            self_eid = "ipn:10.1"
            pool_bytes = 1048576
            retx_interval_ms = 5000

            [cla]
            bind = "127.0.0.1:4556"
            peer = "127.0.0.1:4557"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.self_eid, IpnAddr::new(10, 1));
        assert_eq!(config.pool_bytes, 1_048_576);
        assert_eq!(config.retx_interval_ms, 5_000);
        let cla = config.cla.unwrap();
        assert_eq!(cla.queue_depth, 64);
        assert_eq!(cla.peer.port(), 4557);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config: Config = toml::from_str(r#"self_eid = "ipn:3.1""#).unwrap();
        assert_eq!(config.pool_bytes, 4 * 1024 * 1024);
        assert!(config.cla.is_none());
        assert!(config.offload_dir.is_none());
    }
}


