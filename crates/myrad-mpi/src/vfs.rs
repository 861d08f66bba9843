// vfs.rs — in-memory virtual file store for out-of-band blobs
//
// Large payloads (the compiled light-data blob) travel outside the
// work-unit stream: the master stores the blob under a digest-derived
// name, pushes it to each worker as FileData, and announces the name.
// Digest naming makes re-broadcasts of identical data free.

use std::collections::HashMap;
use std::sync::Arc;

use md4::{Digest, Md4};
use parking_lot::Mutex;

pub struct VirtualFileStore {
    files: Mutex<HashMap<String, Arc<Vec<u8>>>>,
}

impl Default for VirtualFileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFileStore {
    pub fn new() -> VirtualFileStore {
        VirtualFileStore {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Name a blob by content digest and store it. Returns the virtual
    /// filename.
    pub fn store(&self, data: Vec<u8>) -> String {
        let name = digest_name(&data);
        self.files.lock().insert(name.clone(), Arc::new(data));
        name
    }

    /// Store under an explicit name (the worker side, which receives
    /// the name over the wire).
    pub fn store_named(&self, name: &str, data: Vec<u8>) {
        self.files.lock().insert(name.to_string(), Arc::new(data));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Vec<u8>>> {
        self.files.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }
}

fn digest_name(data: &[u8]) -> String {
    let mut hasher = Md4::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(36);
    for b in digest {
        hex.push_str(&format!("{:02x}", b));
    }
    format!("mpi_{}.dat", hex)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_get() {
        let vfs = VirtualFileStore::new();
        let name = vfs.store(vec![1, 2, 3]);
        assert!(name.starts_with("mpi_") && name.ends_with(".dat"));
        assert_eq!(*vfs.get(&name).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_identical_data_same_name() {
        let vfs = VirtualFileStore::new();
        let a = vfs.store(vec![7; 100]);
        let b = vfs.store(vec![7; 100]);
        assert_eq!(a, b);
        let c = vfs.store(vec![8; 100]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_store_named() {
        let vfs = VirtualFileStore::new();
        vfs.store_named("lights.dat", vec![9]);
        assert!(vfs.contains("lights.dat"));
        assert!(!vfs.contains("other.dat"));
    }
}
