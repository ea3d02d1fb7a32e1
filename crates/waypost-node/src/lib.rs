//! # waypost-node
//!
//! Runtime glue around the storage core: configuration, the scheduler
//! thread, a UDP convergence layer, local delivery, and the file-backed
//! offload backend. The daemon binary (`wayposted`) is a thin wrapper over
//! [`start`].

pub mod cla;
pub mod config;
pub mod offload_fs;
pub mod runtime;

pub use config::{ClaConfig, Config};
pub use offload_fs::FsOffload;
pub use runtime::{start, Delivered, NodeHandle};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Cache(#[from] waypost_cache::CacheError),
    #[error(transparent)]
    Codec(#[from] waypost_cbor::CodecError),
    #[error("block pool exhausted")]
    PoolExhausted,
    #[error("storage ingress saturated")]
    Backpressure,
}


