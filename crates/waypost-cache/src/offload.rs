//! # Offload backend
//!
//! Optional pluggable persistence for stored bundles. The cache hands the
//! backend the encoded wire form and keeps only the opaque storage id; the
//! backend's layout is its own business (the reference implementation writes
//! length-prefixed encoded bundles).

/// Opaque persistent storage identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageId(pub u64);

#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    #[error("offload backend is out of space")]
    OutOfSpace,
    #[error("no bundle stored under {0:?}")]
    NotFound(StorageId),
    #[error("offload backend I/O failure: {0}")]
    Io(String),
}

/// Persistent out-of-memory storage for bundle contents.
pub trait OffloadApi: Send {
    /// Persist an encoded bundle, returning its storage id.
    fn offload(&mut self, bundle: &[u8]) -> Result<StorageId, OffloadError>;

    /// Read back a previously offloaded bundle, for retransmission.
    fn restore(&mut self, sid: StorageId) -> Result<Vec<u8>, OffloadError>;

    /// Drop the persistent copy.
    fn release(&mut self, sid: StorageId);
}

/// In-memory offload used by tests and loopback setups.
#[derive(Debug, Default)]
pub struct MemoryOffload {
    next_id: u64,
    stored: std::collections::HashMap<u64, Vec<u8>>,
}

impl MemoryOffload {
    pub fn new() -> Self {
        MemoryOffload::default()
    }

    pub fn stored_count(&self) -> usize {
        self.stored.len()
    }
}

impl OffloadApi for MemoryOffload {
    fn offload(&mut self, bundle: &[u8]) -> Result<StorageId, OffloadError> {
        self.next_id += 1;
        self.stored.insert(self.next_id, bundle.to_vec());
        Ok(StorageId(self.next_id))
    }

    fn restore(&mut self, sid: StorageId) -> Result<Vec<u8>, OffloadError> {
        self.stored
            .get(&sid.0)
            .cloned()
            .ok_or(OffloadError::NotFound(sid))
    }

    fn release(&mut self, sid: StorageId) {
        self.stored.remove(&sid.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offload_restore_release() {
        let mut off = MemoryOffload::new();
        let sid = off.offload(b"bundle bytes").unwrap();
        assert_eq!(off.restore(sid).unwrap(), b"bundle bytes");
        off.release(sid);
        assert!(matches!(off.restore(sid), Err(OffloadError::NotFound(_))));
    }
}


