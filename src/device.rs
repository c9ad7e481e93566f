//! Block device adapter: byte-exact random access over a backing file, with
//! safe extension by whole blocks.
//!
//! Blocks here are small (typically a few KiB) and grown one at a time, so
//! there's no sparse-address-space trick to play: positioned reads/writes
//! give every thread byte-exact access without any unsafe aliasing over a
//! shared mutable map.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use fs4::fs_std::FileExt as _Fs4FileExt;

use crate::error::{Error, Result};

/// Raw, block-indexed access to a single backing file.
pub struct BlockDevice {
    file: File,
    block_size: u32,
    /// Size of the file in blocks, including block 0 (the header block).
    block_count: u32,
}

impl BlockDevice {
    /// Open (creating if necessary) the backing file at `path`, and take an
    /// advisory exclusive lock on it for the lifetime of this device: the
    /// engine is single-writer, and this catches the common mistake of two
    /// processes opening the same database file.
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<(Self, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::device("open", None, e))?;
        _Fs4FileExt::try_lock_exclusive(&file).map_err(|e| Error::device("lock", None, e))?;

        let len = file
            .metadata()
            .map_err(|e| Error::device("stat", None, e))?
            .len();
        let created_new = len == 0;
        let block_count = if created_new {
            0
        } else {
            (len / block_size as u64) as u32
        };

        Ok((
            Self {
                file,
                block_size,
                block_count,
            },
            created_new,
        ))
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Reject indexes whose byte range would exceed the device size.
    pub fn check_block_index(&self, block_index: u32) -> Result<()> {
        if block_index >= self.block_count {
            return Err(Error::corrupt(
                "check_block_index",
                Some(block_index),
                format!(
                    "block {block_index} is out of range (device has {} blocks)",
                    self.block_count
                ),
            ));
        }
        Ok(())
    }

    /// Read `len` bytes at `blockIndex*blockSize + offset`.
    pub fn raw_read(&self, block_index: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        let pos = block_index as u64 * self.block_size as u64 + offset as u64;
        self.file
            .read_exact_at(buf, pos)
            .map_err(|e| Error::device("raw_read", Some(block_index), e))
    }

    /// Write `buf` at `blockIndex*blockSize + offset`.
    pub fn raw_write(&self, block_index: u32, offset: u32, buf: &[u8]) -> Result<()> {
        let pos = block_index as u64 * self.block_size as u64 + offset as u64;
        self.file
            .write_all_at(buf, pos)
            .map_err(|e| Error::device("raw_write", Some(block_index), e))
    }

    /// Read the full contents of one block.
    pub fn read_block(&self, block_index: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size as usize];
        self.raw_read(block_index, 0, &mut buf)?;
        Ok(buf)
    }

    /// Overwrite the full contents of one block.
    pub fn write_block(&self, block_index: u32, bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(bytes.len(), self.block_size as usize);
        self.raw_write(block_index, 0, bytes)
    }

    /// Extend the file by one `blockSize`-sized region, returning its index.
    pub fn make_end_block(&mut self) -> Result<u32> {
        let new_index = self.block_count;
        let new_len = (new_index as u64 + 1) * self.block_size as u64;
        self.file
            .set_len(new_len)
            .map_err(|e| Error::device("make_end_block", Some(new_index), e))?;
        self.block_count += 1;
        Ok(new_index)
    }

    /// Truncate the file down to `block_count` blocks. Used by `tryFlatten`.
    pub fn truncate(&mut self, block_count: u32) -> Result<()> {
        debug_assert!(block_count <= self.block_count);
        self.file
            .set_len(block_count as u64 * self.block_size as u64)
            .map_err(|e| Error::device("truncate", None, e))?;
        self.block_count = block_count;
        Ok(())
    }

    /// Flush OS buffers for this file to the backing storage device.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data().map_err(|e| Error::device("sync", None, e))
    }
}
