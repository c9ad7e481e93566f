//! The 512-byte block-0 header: version magic, fixed parameters, the
//! dual-root commit slots, and the free-index chain head.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 512;
pub const VERSION_MAGIC: &[u8; 8] = b"CBTREE01";
pub const CONTENT_IDENTIFIER_SIZE: usize = 16;
pub const ROOT_INFO_SIZE: usize = 17;
/// Sentinel block index meaning "none" (end of a chain, empty root, etc).
pub const NONE_BLOCK: u32 = u32::MAX;

const SELECTOR_OFFSET: usize = 32;
const ROOT_A_OFFSET: usize = 33;
const ROOT_B_OFFSET: usize = 50;
const HEAD_FREE_INDEX_OFFSET: usize = 67;

/// One version of the tree root, as stored in a 17-byte header slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootInfo {
    pub root_block: u32,
    pub root_is_leaf: bool,
    pub record_count: u64,
    pub index_levels: u8,
}

impl RootInfo {
    pub fn empty() -> Self {
        RootInfo {
            root_block: NONE_BLOCK,
            root_is_leaf: true,
            record_count: 0,
            index_levels: 0,
        }
    }

    fn encode(&self, buf: &mut [u8; ROOT_INFO_SIZE]) {
        LittleEndian::write_u32(&mut buf[0..4], self.root_block);
        buf[4] = self.root_is_leaf as u8;
        LittleEndian::write_u64(&mut buf[5..13], self.record_count);
        buf[13] = self.index_levels;
        buf[14] = 0;
        buf[15] = 0;
        buf[16] = 0;
    }

    fn decode(buf: &[u8; ROOT_INFO_SIZE]) -> Self {
        RootInfo {
            root_block: LittleEndian::read_u32(&buf[0..4]),
            root_is_leaf: buf[4] != 0,
            record_count: LittleEndian::read_u64(&buf[5..13]),
            index_levels: buf[13],
        }
    }
}

/// The parsed block-0 header.
#[derive(Debug, Clone)]
pub struct Header {
    pub block_size: u32,
    pub key_size: u32,
    pub content_identifier: String,
    pub selector: u8,
    pub roots: [RootInfo; 2],
    pub head_free_index_block: u32,
}

impl Header {
    pub fn new(block_size: u32, key_size: u32, content_identifier: &str) -> Self {
        Header {
            block_size,
            key_size,
            content_identifier: content_identifier.to_string(),
            selector: 0,
            roots: [RootInfo::empty(), RootInfo::empty()],
            head_free_index_block: NONE_BLOCK,
        }
    }

    pub fn authoritative(&self) -> &RootInfo {
        &self.roots[self.selector as usize & 1]
    }

    pub fn scratch_index(&self) -> usize {
        (self.selector as usize & 1) ^ 1
    }

    /// Write the non-authoritative slot and flip the selector, in two
    /// separate steps the caller is responsible for sequencing: callers must
    /// persist the scratch slot write before flipping the selector, since the
    /// selector flip is the atomic commit linearization point.
    pub fn stage_scratch(&mut self, info: RootInfo) {
        let idx = self.scratch_index();
        self.roots[idx] = info;
    }

    pub fn flip_selector(&mut self) {
        self.selector ^= 1;
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(VERSION_MAGIC);
        LittleEndian::write_u32(&mut buf[8..12], self.block_size);
        LittleEndian::write_u32(&mut buf[12..16], self.key_size);
        let ident = self.content_identifier.as_bytes();
        let n = ident.len().min(CONTENT_IDENTIFIER_SIZE);
        buf[16..16 + n].copy_from_slice(&ident[..n]);
        buf[SELECTOR_OFFSET] = self.selector;

        let mut a = [0u8; ROOT_INFO_SIZE];
        self.roots[0].encode(&mut a);
        buf[ROOT_A_OFFSET..ROOT_A_OFFSET + ROOT_INFO_SIZE].copy_from_slice(&a);

        let mut b = [0u8; ROOT_INFO_SIZE];
        self.roots[1].encode(&mut b);
        buf[ROOT_B_OFFSET..ROOT_B_OFFSET + ROOT_INFO_SIZE].copy_from_slice(&b);

        LittleEndian::write_u32(
            &mut buf[HEAD_FREE_INDEX_OFFSET..HEAD_FREE_INDEX_OFFSET + 4],
            self.head_free_index_block,
        );
        buf
    }

    /// Decode from the leading `HEADER_SIZE` bytes of a (possibly larger)
    /// block-0 buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::corrupt("header::decode", Some(0), "header block shorter than HEADER_SIZE"));
        }
        if &buf[0..8] != VERSION_MAGIC {
            return Err(Error::corrupt("header::decode", Some(0), "bad version magic"));
        }
        let block_size = LittleEndian::read_u32(&buf[8..12]);
        let key_size = LittleEndian::read_u32(&buf[12..16]);
        let ident_bytes = &buf[16..16 + CONTENT_IDENTIFIER_SIZE];
        let end = ident_bytes.iter().position(|&b| b == 0).unwrap_or(ident_bytes.len());
        let content_identifier = String::from_utf8_lossy(&ident_bytes[..end]).into_owned();
        let selector = buf[SELECTOR_OFFSET];

        let mut a = [0u8; ROOT_INFO_SIZE];
        a.copy_from_slice(&buf[ROOT_A_OFFSET..ROOT_A_OFFSET + ROOT_INFO_SIZE]);
        let mut b = [0u8; ROOT_INFO_SIZE];
        b.copy_from_slice(&buf[ROOT_B_OFFSET..ROOT_B_OFFSET + ROOT_INFO_SIZE]);

        let head_free_index_block =
            LittleEndian::read_u32(&buf[HEAD_FREE_INDEX_OFFSET..HEAD_FREE_INDEX_OFFSET + 4]);

        Ok(Header {
            block_size,
            key_size,
            content_identifier,
            selector,
            roots: [RootInfo::decode(&a), RootInfo::decode(&b)],
            head_free_index_block,
        })
    }

    /// Validate that an existing file's parameters match the ones the caller
    /// configured before `open()`.
    pub fn check_parameters(&self, block_size: u32, key_size: u32, content_identifier: &str) -> Result<()> {
        if self.block_size != block_size {
            return Err(Error::ParameterMismatch(format!(
                "blockSize mismatch: file has {}, configured {}",
                self.block_size, block_size
            )));
        }
        if self.key_size != key_size {
            return Err(Error::ParameterMismatch(format!(
                "keySize mismatch: file has {}, configured {}",
                self.key_size, key_size
            )));
        }
        if self.content_identifier != content_identifier {
            return Err(Error::ParameterMismatch(format!(
                "contentIdentifier mismatch: file has {:?}, configured {:?}",
                self.content_identifier, content_identifier
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut h = Header::new(4096, 32, "test-db");
        h.stage_scratch(RootInfo {
            root_block: 7,
            root_is_leaf: true,
            record_count: 42,
            index_levels: 1,
        });
        h.flip_selector();
        h.head_free_index_block = 99;

        let encoded = h.encode();
        let decoded = Header::decode(&encoded).unwrap();

        assert_eq!(decoded.block_size, 4096);
        assert_eq!(decoded.key_size, 32);
        assert_eq!(decoded.content_identifier, "test-db");
        assert_eq!(decoded.selector, 1);
        assert_eq!(decoded.authoritative().root_block, 7);
        assert_eq!(decoded.authoritative().record_count, 42);
        assert_eq!(decoded.head_free_index_block, 99);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = [0u8; HEADER_SIZE];
        assert!(Header::decode(&buf).is_err());
    }
}
