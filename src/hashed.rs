//! SHA-256 hashed-key convenience wrapper over `Database`.
//!
//! Keys of arbitrary length are hashed and truncated to the database's
//! configured key size, so variable-length keys can ride on a fixed-key-size
//! core without touching its codec.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::tree::Database;

/// `Database` wrapper that accepts `&[u8]`/`&str` keys of any length,
/// digesting them with SHA-256 and truncating to `key_size` bytes before
/// every lookup or mutation.
pub struct HashedDatabase {
    inner: Database,
    key_size: u32,
}

impl HashedDatabase {
    pub fn new(content_identifier: impl Into<String>, key_size: u32) -> Self {
        HashedDatabase {
            inner: Database::new(content_identifier, key_size),
            key_size,
        }
    }

    pub fn set_block_size(&mut self, block_size: u32) {
        self.inner.set_block_size(block_size);
    }

    pub fn set_index_cache_size(&mut self, size: usize) {
        self.inner.set_index_cache_size(size);
    }

    pub fn set_auto_commit(&mut self, auto_commit: bool) {
        self.inner.set_auto_commit(auto_commit);
    }

    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<bool> {
        self.inner.open(path)
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn hash_key(&self, key: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(key);
        let digest = hasher.finalize();
        digest[..self.key_size as usize].to_vec()
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.inner.contains(&self.hash_key(key))
    }

    pub fn contains_str(&self, key: &str) -> Result<bool> {
        self.contains(key.as_bytes())
    }

    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.find(&self.hash_key(key))
    }

    pub fn find_str(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.find(key.as_bytes())
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.inner.insert(&self.hash_key(key), value)
    }

    pub fn insert_str(&self, key: &str, value: &[u8]) -> Result<bool> {
        self.insert(key.as_bytes(), value)
    }

    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.inner.remove(&self.hash_key(key))
    }

    pub fn remove_str(&self, key: &str) -> Result<bool> {
        self.remove(key.as_bytes())
    }

    pub fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.inner.rollback()
    }

    pub fn close(&self, close_device: bool) -> Result<()> {
        self.inner.close(close_device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn insert_and_find_by_str_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hashed.bin");
        let mut db = HashedDatabase::new("test", 16);
        db.set_block_size(256);
        db.open(&path).unwrap();

        assert!(!db.insert_str("player:alice", b"level-3").unwrap());
        assert_eq!(db.find_str("player:alice").unwrap(), Some(b"level-3".to_vec()));
        assert!(!db.contains_str("player:bob").unwrap());
    }

    #[test]
    fn different_keys_hash_to_different_slots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hashed.bin");
        let mut db = HashedDatabase::new("test", 16);
        db.set_block_size(256);
        db.open(&path).unwrap();

        db.insert_str("a", b"1").unwrap();
        db.insert_str("b", b"2").unwrap();
        assert_eq!(db.find_str("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.find_str("b").unwrap(), Some(b"2".to_vec()));
    }
}
