//! Directory-backed offload: one file per stored bundle, holding the
//! length-prefixed encoded wire form.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

use tracing::warn;
use waypost_cache::{OffloadApi, OffloadError, StorageId};

pub struct FsOffload {
    dir: PathBuf,
    next_id: u64,
}

impl FsOffload {
    pub fn open(dir: PathBuf) -> std::io::Result<FsOffload> {
        fs::create_dir_all(&dir)?;
        // Resume numbering past anything already on disk.
        let mut next_id = 1;
        for dirent in fs::read_dir(&dir)? {
            let name = dirent?.file_name();
            if let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".bundle")) {
                if let Ok(id) = u64::from_str_radix(stem, 16) {
                    next_id = next_id.max(id + 1);
                }
            }
        }
        Ok(FsOffload { dir, next_id })
    }

    fn path_for(&self, sid: StorageId) -> PathBuf {
        self.dir.join(format!("{:016x}.bundle", sid.0))
    }
}

impl OffloadApi for FsOffload {
    fn offload(&mut self, bundle: &[u8]) -> Result<StorageId, OffloadError> {
        let sid = StorageId(self.next_id);
        self.next_id += 1;
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(self.path_for(sid))?;
            file.write_all(&(bundle.len() as u32).to_be_bytes())?;
            file.write_all(bundle)?;
            file.sync_all()
        };
        write().map_err(|err| OffloadError::Io(err.to_string()))?;
        Ok(sid)
    }

    fn restore(&mut self, sid: StorageId) -> Result<Vec<u8>, OffloadError> {
        let mut file =
            fs::File::open(self.path_for(sid)).map_err(|_| OffloadError::NotFound(sid))?;
        let mut prefix = [0u8; 4];
        file.read_exact(&mut prefix)
            .map_err(|err| OffloadError::Io(err.to_string()))?;
        let len = u32::from_be_bytes(prefix) as usize;
        let mut bundle = vec![0u8; len];
        file.read_exact(&mut bundle)
            .map_err(|err| OffloadError::Io(err.to_string()))?;
        Ok(bundle)
    }

    fn release(&mut self, sid: StorageId) {
        if let Err(err) = fs::remove_file(self.path_for(sid)) {
            warn!(%err, sid = sid.0, "failed to drop offloaded bundle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut off = FsOffload::open(dir.path().to_path_buf()).unwrap();
        let sid = off.offload(b"encoded bundle").unwrap();
        assert_eq!(off.restore(sid).unwrap(), b"encoded bundle");
        off.release(sid);
        assert!(matches!(off.restore(sid), Err(OffloadError::NotFound(_))));
    }

    #[test]
    fn numbering_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let mut off = FsOffload::open(dir.path().to_path_buf()).unwrap();
            off.offload(b"a").unwrap()
        };
        let mut off = FsOffload::open(dir.path().to_path_buf()).unwrap();
        let second = off.offload(b"b").unwrap();
        assert!(second.0 > first.0);
        assert_eq!(off.restore(first).unwrap(), b"a");
    }
}


