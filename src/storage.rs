//! The free-space allocator and commit/rollback transaction state: the
//! layer between the raw block device and the B-tree operations in
//! `tree.rs`.
//!
//! `uncommitted`/`uncommitted_writes` is the pre-image map that makes
//! rollback possible: a committed block is never overwritten in place
//! without first copying its prior bytes aside.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::{debug, warn};

use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::header::{Header, RootInfo, HEADER_SIZE, NONE_BLOCK};
use crate::node::FreeIndexBlock;

pub struct Storage {
    device: BlockDevice,
    header: Header,
    block_size: u32,
    key_size: u32,
    uncommitted: HashSet<u32>,
    uncommitted_writes: HashMap<u32, Vec<u8>>,
    /// Blocks freed-and-reusable within the current transaction only
    /// (fast path: a block that was itself only ever written this
    /// transaction). Reset empty at every transaction boundary.
    available_blocks: Vec<u32>,
    /// Working copy of the free-index chain head, mutated as the chain is
    /// pushed/popped during a transaction and folded back into the header
    /// at commit.
    free_index_head: u32,
    /// Device block count as of the last commit/rollback, used to truncate
    /// back any blocks a rolled-back transaction appended via `make_end_block`.
    txn_start_block_count: u32,
}

impl Storage {
    /// Open (or create) the backing file and validate/establish its header.
    pub fn open(
        path: impl AsRef<Path>,
        block_size: u32,
        key_size: u32,
        content_identifier: &str,
    ) -> Result<(Self, bool)> {
        let (mut device, created_new) = BlockDevice::open(path, block_size)?;

        let header = if created_new {
            device.make_end_block()?; // block 0, the header block
            Header::new(block_size, key_size, content_identifier)
        } else {
            let buf = device.read_block(0)?;
            let header = Header::decode(&buf)?;
            header.check_parameters(block_size, key_size, content_identifier)?;
            header
        };

        let free_index_head = header.head_free_index_block;
        let block_count = device.block_count();
        let mut storage = Storage {
            device,
            header,
            block_size,
            key_size,
            uncommitted: HashSet::new(),
            uncommitted_writes: HashMap::new(),
            available_blocks: Vec::new(),
            free_index_head,
            txn_start_block_count: block_count,
        };

        if created_new {
            storage.commit(RootInfo::empty())?;
        }

        Ok((storage, created_new))
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    pub fn root(&self) -> RootInfo {
        *self.header.authoritative()
    }

    pub fn total_block_count(&self) -> u32 {
        self.device.block_count()
    }

    pub fn read_block(&self, block_index: u32) -> Result<Vec<u8>> {
        self.device.check_block_index(block_index)?;
        self.device.read_block(block_index)
    }

    /// Write `bytes` to `block_index`, capturing the pre-image the first
    /// time a committed block is touched this transaction.
    pub fn update_block(&mut self, block_index: u32, bytes: &[u8]) -> Result<()> {
        self.device.check_block_index(block_index)?;
        if !self.uncommitted.contains(&block_index) {
            let pre_image = self.device.read_block(block_index)?;
            self.uncommitted_writes.entry(block_index).or_insert(pre_image);
            self.uncommitted.insert(block_index);
        }
        self.device.write_block(block_index, bytes)
    }

    /// Pop an available block index, extending the file only as a last resort.
    pub fn reserve_block(&mut self) -> Result<u32> {
        if let Some(b) = self.available_blocks.pop() {
            self.uncommitted.insert(b);
            return Ok(b);
        }
        if let Some(b) = self.pop_free_index()? {
            self.uncommitted.insert(b);
            return Ok(b);
        }
        let b = self.device.make_end_block()?;
        self.uncommitted.insert(b);
        Ok(b)
    }

    /// Release `block_index` back to the allocator. Blocks only ever
    /// written this transaction are reusable immediately; blocks that were
    /// part of the last committed state are recorded durably in the
    /// free-index chain and only become reusable after a successful commit.
    pub fn free_block(&mut self, block_index: u32) -> Result<()> {
        if self.uncommitted.contains(&block_index) {
            self.available_blocks.push(block_index);
            Ok(())
        } else {
            self.push_free_index(block_index)
        }
    }

    fn read_free_index_block(&self, block_index: u32) -> Result<FreeIndexBlock> {
        let bytes = self.device.read_block(block_index)?;
        FreeIndexBlock::decode(&bytes)
    }

    fn write_free_index_block(&mut self, block_index: u32, block: &FreeIndexBlock) -> Result<()> {
        let bytes = block.encode(self.block_size as usize)?;
        self.update_block(block_index, &bytes)
    }

    fn push_free_index(&mut self, block_index: u32) -> Result<()> {
        if self.free_index_head == NONE_BLOCK {
            let new_head = self.reserve_block()?;
            let block = FreeIndexBlock {
                next: None,
                free_blocks: vec![block_index],
            };
            self.write_free_index_block(new_head, &block)?;
            self.free_index_head = new_head;
            return Ok(());
        }

        let head = self.free_index_head;
        let mut block = self.read_free_index_block(head)?;
        if block.free_blocks.len() < FreeIndexBlock::capacity(self.block_size as usize) {
            block.free_blocks.push(block_index);
            self.write_free_index_block(head, &block)?;
        } else {
            let new_head = self.reserve_block()?;
            let new_block = FreeIndexBlock {
                next: Some(head),
                free_blocks: vec![block_index],
            };
            self.write_free_index_block(new_head, &new_block)?;
            self.free_index_head = new_head;
        }
        Ok(())
    }

    /// Pop one block index off the durable free-index chain, advancing (and
    /// recycling) the head block as it empties.
    fn pop_free_index(&mut self) -> Result<Option<u32>> {
        if self.free_index_head == NONE_BLOCK {
            return Ok(None);
        }
        let head = self.free_index_head;
        let mut block = self.read_free_index_block(head)?;
        let popped = match block.free_blocks.pop() {
            Some(b) => b,
            None => return Ok(None),
        };

        if block.free_blocks.is_empty() {
            self.free_index_head = block.next.unwrap_or(NONE_BLOCK);
            self.free_block(head)?;
        } else {
            self.write_free_index_block(head, &block)?;
        }
        Ok(Some(popped))
    }

    /// Run the dual-root commit protocol: stage the new root and free-index
    /// head into the non-authoritative slot, flush, flip the selector, then
    /// clear transaction state.
    pub fn commit(&mut self, root: RootInfo) -> Result<()> {
        let leftovers = std::mem::take(&mut self.available_blocks);
        for b in leftovers {
            self.push_free_index(b)?;
        }

        self.header.head_free_index_block = self.free_index_head;
        self.header.stage_scratch(root);
        self.write_header_block()?;
        self.device.sync()?;

        self.header.flip_selector();
        self.write_header_block_direct()?;
        self.device.sync()?;

        debug!(
            "committed: root_block={} record_count={} index_levels={}",
            root.root_block, root.record_count, root.index_levels
        );

        self.uncommitted.clear();
        self.uncommitted_writes.clear();
        self.available_blocks.clear();
        self.txn_start_block_count = self.device.block_count();
        Ok(())
    }

    /// Undo every write made since the last commit.
    pub fn rollback(&mut self) -> Result<()> {
        let writes = std::mem::take(&mut self.uncommitted_writes);
        for (block_index, pre_image) in writes {
            self.device.write_block(block_index, &pre_image)?;
        }
        self.uncommitted.clear();
        self.available_blocks.clear();
        self.device.truncate(self.txn_start_block_count)?;

        let header_bytes = self.device.read_block(0)?;
        self.header = Header::decode(&header_bytes)?;
        self.free_index_head = self.header.head_free_index_block;
        warn!("rolled back transaction");
        Ok(())
    }

    fn header_block_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.block_size as usize];
        let header_bytes = self.header.encode();
        buf[..HEADER_SIZE].copy_from_slice(&header_bytes);
        buf
    }

    fn write_header_block(&mut self) -> Result<()> {
        let buf = self.header_block_bytes();
        self.update_block(0, &buf)
    }

    /// Write the header directly, bypassing pre-image capture: used only
    /// for the selector flip, which is the irrevocable linearization point.
    fn write_header_block_direct(&mut self) -> Result<()> {
        let buf = self.header_block_bytes();
        self.device.write_block(0, &buf)
    }

    /// Walk the authoritative free-index chain, yielding every recorded
    /// free block index. Used by maintenance/diagnostic paths; not on the
    /// hot allocation path (see `reserve_block`).
    pub fn free_index_chain(&self) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let mut cursor = self.header.head_free_index_block;
        while cursor != NONE_BLOCK {
            let block = self.read_free_index_block(cursor)?;
            out.extend(block.free_blocks.iter().copied());
            cursor = block.next.unwrap_or(NONE_BLOCK);
        }
        Ok(out)
    }

    pub fn free_block_count(&self) -> Result<u32> {
        Ok(self.free_index_chain()?.len() as u32 + self.available_blocks.len() as u32)
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.uncommitted.is_empty() {
            return Err(Error::corrupt(
                "storage::close",
                None,
                "closed with an uncommitted transaction in flight",
            ));
        }
        Ok(())
    }

    /// Whether a transaction with pending (uncommitted) writes is in flight.
    pub fn has_uncommitted(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Drop the free-index chain from the working header state, without
    /// freeing its blocks: used by `tryFlatten`, which rebuilds the whole
    /// block layout from scratch and leaves nothing to track as free.
    pub fn clear_free_index_chain(&mut self) {
        self.free_index_head = NONE_BLOCK;
    }

    /// Shrink the backing file to `block_count` blocks. Only valid
    /// immediately after a commit, since there is no pre-image to preserve
    /// for the blocks being dropped.
    pub fn compact_truncate(&mut self, block_count: u32) -> Result<()> {
        debug_assert!(self.uncommitted.is_empty());
        self.device.truncate(block_count)?;
        self.txn_start_block_count = block_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_header_with_empty_root() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bin");
        let (storage, created) = Storage::open(&path, 256, 8, "test").unwrap();
        assert!(created);
        assert_eq!(storage.root().root_block, NONE_BLOCK);
        assert_eq!(storage.root().record_count, 0);
    }

    #[test]
    fn reserve_and_free_round_trip_within_transaction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bin");
        let (mut storage, _) = Storage::open(&path, 256, 8, "test").unwrap();
        let b1 = storage.reserve_block().unwrap();
        storage.update_block(b1, &vec![7u8; 256]).unwrap();
        storage.free_block(b1).unwrap();
        let b2 = storage.reserve_block().unwrap();
        assert_eq!(b1, b2);
    }

    #[test]
    fn rollback_restores_preimage_and_truncates_growth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bin");
        let (mut storage, _) = Storage::open(&path, 256, 8, "test").unwrap();
        let before = storage.total_block_count();

        let b = storage.reserve_block().unwrap();
        storage.update_block(b, &vec![9u8; 256]).unwrap();
        storage.rollback().unwrap();

        assert_eq!(storage.total_block_count(), before);
    }

    #[test]
    fn freed_committed_block_is_reused_after_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bin");
        let (mut storage, _) = Storage::open(&path, 256, 8, "test").unwrap();

        let b = storage.reserve_block().unwrap();
        storage.update_block(b, &vec![1u8; 256]).unwrap();
        storage.commit(storage.root()).unwrap();

        storage.free_block(b).unwrap();
        storage.commit(storage.root()).unwrap();

        let reused = storage.reserve_block().unwrap();
        assert_eq!(reused, b);
    }
}
