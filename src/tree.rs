//! The public `Database` type: B-tree descent, insert/remove with
//! split/merge propagation, range scans, the dual-root commit protocol, and
//! its locking model.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error};
use parking_lot::RwLock;

use crate::cache::IndexCache;
use crate::error::{Error, Result};
use crate::header::{RootInfo, NONE_BLOCK};
use crate::node::{IndexEntry, IndexNode, LeafEntry, LeafNode};
use crate::storage::Storage;

/// Tree state guarded by the main readers/writer lock. The index cache is
/// deliberately kept outside this lock (see `IndexCache`'s doc comment).
struct State {
    storage: Storage,
    /// The root as of the most recent write in the current transaction;
    /// equal to `storage.root()` whenever no transaction is in flight.
    pending_root: RootInfo,
}

#[derive(Clone, Copy)]
struct PathEntry {
    block: u32,
    child_pos: usize,
}

/// Block-structured B-tree key/value store with copy-on-write allocation
/// and dual-root atomic commit.
pub struct Database {
    content_identifier: String,
    key_size: u32,
    block_size: u32,
    index_cache_size: usize,
    auto_commit: bool,
    path: Option<PathBuf>,
    state: RwLock<Option<State>>,
    cache: IndexCache,
}

const DEFAULT_BLOCK_SIZE: u32 = 4096;
const DEFAULT_INDEX_CACHE_SIZE: usize = 1024;

impl Database {
    pub fn new(content_identifier: impl Into<String>, key_size: u32) -> Self {
        Database {
            content_identifier: content_identifier.into(),
            key_size,
            block_size: DEFAULT_BLOCK_SIZE,
            index_cache_size: DEFAULT_INDEX_CACHE_SIZE,
            auto_commit: true,
            path: None,
            state: RwLock::new(None),
            cache: IndexCache::new(DEFAULT_INDEX_CACHE_SIZE),
        }
    }

    fn ensure_closed(&self, op: &'static str) -> Result<()> {
        if self.state.read().is_some() {
            return Err(Error::bad_param(op, "cannot change parameters while open"));
        }
        Ok(())
    }

    pub fn set_block_size(&mut self, block_size: u32) {
        self.ensure_closed("set_block_size").expect("parameters are immutable once open");
        self.block_size = block_size;
    }

    pub fn set_index_cache_size(&mut self, size: usize) {
        self.ensure_closed("set_index_cache_size").expect("parameters are immutable once open");
        self.index_cache_size = size;
        self.cache = IndexCache::new(size.max(1));
    }

    pub fn set_auto_commit(&mut self, auto_commit: bool) {
        self.auto_commit = auto_commit;
    }

    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<bool> {
        if self.state.read().is_some() {
            return Err(Error::bad_param("open", "database is already open"));
        }
        let (storage, created_new) =
            Storage::open(path.as_ref(), self.block_size, self.key_size, &self.content_identifier)?;
        let mut state = State {
            pending_root: storage.root(),
            storage,
        };
        ensure_root_leaf(&mut state, self.key_size, self.block_size)?;
        self.path = Some(path.as_ref().to_path_buf());
        *self.state.write() = Some(state);
        debug!("opened database at {:?} (created_new={created_new})", path.as_ref());
        Ok(created_new)
    }

    pub fn is_open(&self) -> bool {
        self.state.read().is_some()
    }

    fn with_state<R>(&self, op: &'static str, f: impl FnOnce(&State, &IndexCache) -> Result<R>) -> Result<R> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(Error::NotOpen)?;
        let _ = op;
        f(state, &self.cache)
    }

    fn with_state_mut<R>(&self, op: &'static str, f: impl FnOnce(&mut State, &IndexCache) -> Result<R>) -> Result<R> {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(Error::NotOpen)?;
        let result = f(state, &self.cache);
        if result.is_err() {
            // Write paths roll back automatically on error.
            if state.storage.has_uncommitted() {
                error!("{op} failed, rolling back");
                let _ = state.storage.rollback();
                state.pending_root = state.storage.root();
                self.cache.clear();
            }
        }
        result
    }

    fn check_key(&self, key: &[u8], op: &'static str) -> Result<()> {
        if key.len() as u32 != self.key_size {
            return Err(Error::bad_param(op, format!("key must be {} bytes, got {}", self.key_size, key.len())));
        }
        Ok(())
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.check_key(key, "contains")?;
        self.with_state("contains", |state, cache| {
            let (_, _, leaf) = descend(&state.storage, cache, state.pending_root, self.key_size, key)?;
            Ok(leaf.find_index(key).is_ok())
        })
    }

    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key, "find")?;
        self.with_state("find", |state, cache| {
            let (_, _, leaf) = descend(&state.storage, cache, state.pending_root, self.key_size, key)?;
            match leaf.find_index(key) {
                Ok(i) => Ok(Some(read_value(&state.storage, &leaf.entries[i])?)),
                Err(_) => Ok(None),
            }
        })
    }

    pub fn find_range(&self, lower: &[u8], upper: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        self.for_each(lower, upper, |k, v| out.push((k.to_vec(), v.to_vec())))?;
        Ok(out)
    }

    pub fn for_each(&self, lower: &[u8], upper: &[u8], mut visit: impl FnMut(&[u8], &[u8])) -> Result<()> {
        self.with_state("for_each", |state, cache| {
            let (_, _, mut leaf) = descend(&state.storage, cache, state.pending_root, self.key_size, lower)?;
            loop {
                for e in &leaf.entries {
                    if e.key.as_slice() < lower {
                        continue;
                    }
                    if e.key.as_slice() > upper {
                        return Ok(());
                    }
                    let value = read_value(&state.storage, e)?;
                    visit(&e.key, &value);
                }
                match leaf.next_leaf {
                    Some(next) => leaf = read_leaf(&state.storage, next, self.key_size)?,
                    None => return Ok(()),
                }
            }
        })
    }

    pub fn for_all(&self, mut visit: impl FnMut(&[u8], &[u8])) -> Result<()> {
        self.with_state("for_all", |state, cache| {
            let mut block = leftmost_leaf_block(&state.storage, cache, state.pending_root, self.key_size)?;
            loop {
                let leaf = read_leaf(&state.storage, block, self.key_size)?;
                for e in &leaf.entries {
                    let value = read_value(&state.storage, e)?;
                    visit(&e.key, &value);
                }
                match leaf.next_leaf {
                    Some(next) => block = next,
                    None => return Ok(()),
                }
            }
        })
    }

    /// Best-effort scan that tolerates individual node read/decode
    /// failures, routing them to `on_error` and continuing to the next
    /// intact leaf it can reach by re-descending from the root.
    pub fn recover_all(&self, mut visit: impl FnMut(&[u8], &[u8]), mut on_error: impl FnMut(&Error)) -> Result<()> {
        self.with_state("recover_all", |state, cache| {
            let root = state.pending_root;
            let leaves = match collect_leaf_blocks(&state.storage, cache, root, self.key_size) {
                Ok(l) => l,
                Err(e) => {
                    on_error(&e);
                    Vec::new()
                }
            };
            for block in leaves {
                match read_leaf(&state.storage, block, self.key_size) {
                    Ok(leaf) => {
                        for entry in &leaf.entries {
                            match read_value(&state.storage, entry) {
                                Ok(value) => visit(&entry.key, &value),
                                Err(e) => on_error(&e),
                            }
                        }
                    }
                    Err(e) => on_error(&e),
                }
            }
            Ok(())
        })
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.check_key(key, "insert")?;
        let key_size = self.key_size;
        let block_size = self.block_size;
        let auto_commit = self.auto_commit;
        self.with_state_mut("insert", |state, cache| {
            let overwritten = insert_impl(state, cache, key, value, key_size, block_size)?;
            if auto_commit {
                state.storage.commit(state.pending_root)?;
            }
            Ok(overwritten)
        })
    }

    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.check_key(key, "remove")?;
        let key_size = self.key_size;
        let block_size = self.block_size;
        let auto_commit = self.auto_commit;
        self.with_state_mut("remove", |state, cache| {
            let existed = remove_impl(state, cache, key, key_size, block_size)?;
            if auto_commit {
                state.storage.commit(state.pending_root)?;
            }
            Ok(existed)
        })
    }

    pub fn remove_range(&self, lower: &[u8], upper: &[u8]) -> Result<Vec<Vec<u8>>> {
        let key_size = self.key_size;
        let block_size = self.block_size;
        let auto_commit = self.auto_commit;
        let lower = lower.to_vec();
        let upper = upper.to_vec();
        self.with_state_mut("remove_range", |state, cache| {
            let mut removed = Vec::new();
            loop {
                let next_key = {
                    let (_, _, mut leaf) = descend(&state.storage, cache, state.pending_root, key_size, &lower)?;
                    loop {
                        if let Some(k) = leaf
                            .entries
                            .iter()
                            .find(|e| e.key.as_slice() >= lower.as_slice() && e.key.as_slice() <= upper.as_slice())
                            .map(|e| e.key.clone())
                        {
                            break Some(k);
                        }
                        // Entries are sorted; once one exceeds `upper` every later
                        // entry in this leaf and every later leaf does too.
                        if leaf.entries.iter().any(|e| e.key.as_slice() > upper.as_slice()) {
                            break None;
                        }
                        match leaf.next_leaf {
                            Some(next) => leaf = read_leaf(&state.storage, next, key_size)?,
                            None => break None,
                        }
                    }
                };
                let Some(k) = next_key else { break };
                remove_impl(state, cache, &k, key_size, block_size)?;
                removed.push(k);
            }
            if auto_commit {
                state.storage.commit(state.pending_root)?;
            }
            Ok(removed)
        })
    }

    pub fn record_count(&self) -> u64 {
        self.state.read().as_ref().map(|s| s.storage.root().record_count).unwrap_or(0)
    }

    pub fn index_levels(&self) -> u8 {
        self.state.read().as_ref().map(|s| s.storage.root().index_levels).unwrap_or(0)
    }

    pub fn total_block_count(&self) -> u32 {
        self.state.read().as_ref().map(|s| s.storage.total_block_count()).unwrap_or(0)
    }

    pub fn free_block_count(&self) -> u32 {
        self.state
            .read()
            .as_ref()
            .and_then(|s| s.storage.free_block_count().ok())
            .unwrap_or(0)
    }

    pub fn index_block_count(&self) -> u32 {
        self.with_state("index_block_count", |state, cache| {
            let (idx, _leaf) = count_node_kinds(&state.storage, cache, state.storage.root(), self.key_size)?;
            Ok(idx)
        })
        .unwrap_or(0)
    }

    pub fn leaf_block_count(&self) -> u32 {
        self.with_state("leaf_block_count", |state, cache| {
            let (_idx, leaf) = count_node_kinds(&state.storage, cache, state.storage.root(), self.key_size)?;
            Ok(leaf)
        })
        .unwrap_or(0)
    }

    pub fn commit(&self) -> Result<()> {
        self.with_state_mut("commit", |state, _cache| {
            state.storage.commit(state.pending_root)
        })
    }

    pub fn rollback(&self) -> Result<()> {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(Error::NotOpen)?;
        state.storage.rollback()?;
        state.pending_root = state.storage.root();
        self.cache.clear();
        Ok(())
    }

    /// Maintenance operation: renumber reachable blocks into a contiguous
    /// prefix and truncate the file, when churn has left enough slack to be
    /// worth the rewrite.
    pub fn try_flatten(&self) -> Result<bool> {
        let key_size = self.key_size;
        let block_size = self.block_size;
        self.with_state_mut("try_flatten", |state, cache| {
            let root = state.storage.root();
            let total = state.storage.total_block_count();
            let reachable = collect_reachable_blocks(&state.storage, cache, root, key_size)?;
            if (reachable.len() as u32 + 1) * 2 > total {
                return Ok(false);
            }
            flatten(state, cache, &reachable, key_size, block_size)?;
            Ok(true)
        })
    }

    pub fn close(&self, close_device: bool) -> Result<()> {
        let mut guard = self.state.write();
        if let Some(state) = guard.as_mut() {
            if state.storage.has_uncommitted() {
                if self.auto_commit {
                    state.storage.commit(state.pending_root)?;
                } else {
                    state.storage.rollback()?;
                }
            }
        }
        if close_device {
            *guard = None;
            self.cache.clear();
        }
        Ok(())
    }
}

fn ensure_root_leaf(state: &mut State, key_size: u32, block_size: u32) -> Result<()> {
    if state.pending_root.root_block != NONE_BLOCK {
        return Ok(());
    }
    let leaf = LeafNode::empty();
    let bytes = leaf.encode(key_size as usize, block_size as usize)?;
    let idx = state.storage.reserve_block()?;
    state.storage.update_block(idx, &bytes)?;
    let root = RootInfo {
        root_block: idx,
        root_is_leaf: true,
        record_count: 0,
        index_levels: 0,
    };
    state.storage.commit(root)?;
    state.pending_root = root;
    Ok(())
}

fn load_index(storage: &Storage, cache: &IndexCache, block: u32, key_size: u32) -> Result<Arc<IndexNode>> {
    if let Some(n) = cache.get(block) {
        return Ok(n);
    }
    let bytes = storage.read_block(block)?;
    let node = Arc::new(IndexNode::decode(&bytes, key_size as usize)?);
    cache.insert(block, node.clone());
    Ok(node)
}

fn write_index(
    storage: &mut Storage,
    cache: &IndexCache,
    block: u32,
    node: &IndexNode,
    key_size: u32,
    block_size: u32,
) -> Result<()> {
    let bytes = node.encode(key_size as usize, block_size as usize)?;
    storage.update_block(block, &bytes)?;
    cache.insert(block, Arc::new(node.clone()));
    Ok(())
}

fn read_leaf(storage: &Storage, block: u32, key_size: u32) -> Result<LeafNode> {
    let bytes = storage.read_block(block)?;
    LeafNode::decode(&bytes, key_size as usize)
}

fn write_leaf(storage: &mut Storage, block: u32, node: &LeafNode, key_size: u32, block_size: u32) -> Result<()> {
    let bytes = node.encode(key_size as usize, block_size as usize)?;
    storage.update_block(block, &bytes)
}

fn search_child(node: &IndexNode, key: &[u8]) -> usize {
    let mut lo = 0usize;
    let mut hi = node.entries.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if node.entries[mid].key.as_slice() <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

fn descend(
    storage: &Storage,
    cache: &IndexCache,
    root: RootInfo,
    key_size: u32,
    key: &[u8],
) -> Result<(Vec<PathEntry>, u32, LeafNode)> {
    let mut block = root.root_block;
    let mut is_leaf = root.root_is_leaf;
    let mut path = Vec::new();
    loop {
        if is_leaf {
            let leaf = read_leaf(storage, block, key_size)?;
            return Ok((path, block, leaf));
        }
        let node = load_index(storage, cache, block, key_size)?;
        let pos = search_child(&node, key);
        let next_block = node.pointer(pos);
        let next_is_leaf = node.level == 0;
        path.push(PathEntry { block, child_pos: pos });
        block = next_block;
        is_leaf = next_is_leaf;
    }
}

fn leftmost_leaf_block(storage: &Storage, cache: &IndexCache, root: RootInfo, key_size: u32) -> Result<u32> {
    let mut block = root.root_block;
    let mut is_leaf = root.root_is_leaf;
    while !is_leaf {
        let node = load_index(storage, cache, block, key_size)?;
        block = node.pointer(0);
        is_leaf = node.level == 0;
    }
    Ok(block)
}

fn read_value(storage: &Storage, entry: &LeafEntry) -> Result<Vec<u8>> {
    if entry.tail_blocks.is_empty() {
        return Ok(entry.inline_value.clone());
    }
    let mut out = Vec::with_capacity(entry.value_len as usize);
    for &b in &entry.tail_blocks {
        out.extend_from_slice(&storage.read_block(b)?);
    }
    out.truncate(entry.value_len as usize);
    Ok(out)
}

fn value_fits_inline(key_size: u32, value_len: usize, block_size: u32) -> bool {
    leaf_sole_element_size(key_size, value_len) <= block_size as usize
}

fn leaf_sole_element_size(key_size: u32, value_len: usize) -> usize {
    // A leaf with exactly one element and no `nextLeaf`: header(7) + key +
    // varint(valueLen) + varint(inlineLen==valueLen) + valueLen + varint(0).
    7 + key_size as usize + varint_len(value_len as u64) + varint_len(value_len as u64) + value_len + 1
}

fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

fn make_leaf_entry(storage: &mut Storage, key: &[u8], value: &[u8], key_size: u32, block_size: u32) -> Result<LeafEntry> {
    let value_len = value.len() as u64;
    if value_fits_inline(key_size, value.len(), block_size) {
        return Ok(LeafEntry {
            key: key.to_vec(),
            inline_value: value.to_vec(),
            value_len,
            tail_blocks: Vec::new(),
        });
    }
    let mut tail_blocks = Vec::new();
    let mut offset = 0usize;
    while offset < value.len() {
        let end = (offset + block_size as usize).min(value.len());
        let chunk = &value[offset..end];
        let mut buf = vec![0u8; block_size as usize];
        buf[..chunk.len()].copy_from_slice(chunk);
        let idx = storage.reserve_block()?;
        storage.update_block(idx, &buf)?;
        tail_blocks.push(idx);
        offset = end;
    }
    Ok(LeafEntry {
        key: key.to_vec(),
        inline_value: Vec::new(),
        value_len,
        tail_blocks,
    })
}

fn free_tail_blocks(storage: &mut Storage, entry: &LeafEntry) -> Result<()> {
    for &b in &entry.tail_blocks {
        storage.free_block(b)?;
    }
    Ok(())
}

/// Write `leaf` to a freshly reserved block and free `old_block`. The
/// committed block at `old_block` is never touched — a crash before the
/// transaction's selector flip leaves it exactly as it was.
fn cow_write_leaf(storage: &mut Storage, old_block: u32, leaf: &LeafNode, key_size: u32, block_size: u32) -> Result<u32> {
    let new_block = storage.reserve_block()?;
    write_leaf(storage, new_block, leaf, key_size, block_size)?;
    storage.free_block(old_block)?;
    Ok(new_block)
}

/// Write `node` to a freshly reserved block, free `old_block`, and drop
/// `old_block` from the index cache (its content no longer reflects any
/// reachable version of the tree).
fn cow_write_index(
    storage: &mut Storage,
    cache: &IndexCache,
    old_block: u32,
    node: &IndexNode,
    key_size: u32,
    block_size: u32,
) -> Result<u32> {
    let new_block = storage.reserve_block()?;
    write_index(storage, cache, new_block, node, key_size, block_size)?;
    storage.free_block(old_block)?;
    cache.invalidate(old_block);
    Ok(new_block)
}

/// Cascade a child block's new address up through `path` to the root: each
/// ancestor only has a pointer value changed, so it is rewritten to a new
/// block and its own parent's pointer updated in turn, all the way up.
fn propagate_replace(
    state: &mut State,
    cache: &IndexCache,
    mut path: Vec<PathEntry>,
    mut new_child: u32,
    key_size: u32,
    block_size: u32,
) -> Result<()> {
    while let Some(entry) = path.pop() {
        let mut node = (*load_index(&state.storage, cache, entry.block, key_size)?).clone();
        node.update_pointer(entry.child_pos, new_child);
        new_child = cow_write_index(&mut state.storage, cache, entry.block, &node, key_size, block_size)?;
    }
    state.pending_root.root_block = new_child;
    Ok(())
}

fn insert_impl(
    state: &mut State,
    cache: &IndexCache,
    key: &[u8],
    value: &[u8],
    key_size: u32,
    block_size: u32,
) -> Result<bool> {
    let root = state.pending_root;
    let (path, leaf_block, mut leaf) = descend(&state.storage, cache, root, key_size, key)?;

    let new_entry = make_leaf_entry(&mut state.storage, key, value, key_size, block_size)?;
    let overwritten = match leaf.find_index(key) {
        Ok(i) => {
            let old = leaf.remove(i);
            free_tail_blocks(&mut state.storage, &old)?;
            leaf.insert(i, new_entry);
            true
        }
        Err(i) => {
            leaf.insert(i, new_entry);
            state.pending_root.record_count += 1;
            false
        }
    };

    if leaf.encoded_size(key_size as usize) > block_size as usize {
        let split_at = (leaf.count() / 2).max(1);
        let mut right = leaf.split(split_at);
        right.next_leaf = leaf.next_leaf;
        let right_block = state.storage.reserve_block()?;
        leaf.next_leaf = Some(right_block);
        let left_block = state.storage.reserve_block()?;
        write_leaf(&mut state.storage, left_block, &leaf, key_size, block_size)?;
        write_leaf(&mut state.storage, right_block, &right, key_size, block_size)?;
        state.storage.free_block(leaf_block)?;
        let separator = right.entries[0].key.clone();
        propagate_insert(state, cache, path, separator, left_block, right_block, key_size, block_size)?;
    } else {
        let new_block = cow_write_leaf(&mut state.storage, leaf_block, &leaf, key_size, block_size)?;
        propagate_replace(state, cache, path, new_block, key_size, block_size)?;
    }

    Ok(overwritten)
}

fn propagate_insert(
    state: &mut State,
    cache: &IndexCache,
    mut path: Vec<PathEntry>,
    mut separator: Vec<u8>,
    mut left_child: u32,
    mut right_child: u32,
    key_size: u32,
    block_size: u32,
) -> Result<()> {
    let mut last_level: Option<u8> = None;
    loop {
        match path.pop() {
            Some(entry) => {
                let mut node = (*load_index(&state.storage, cache, entry.block, key_size)?).clone();
                node.update_pointer(entry.child_pos, left_child);
                node.insert_after(entry.child_pos, separator.clone(), right_child);
                last_level = Some(node.level);

                if node.encoded_size(key_size as usize) > block_size as usize {
                    let split_at = (node.entries.len() / 2).max(1);
                    let (right, new_sep) = node.split(split_at);
                    let new_left_block = state.storage.reserve_block()?;
                    let new_right_block = state.storage.reserve_block()?;
                    write_index(&mut state.storage, cache, new_left_block, &node, key_size, block_size)?;
                    write_index(&mut state.storage, cache, new_right_block, &right, key_size, block_size)?;
                    state.storage.free_block(entry.block)?;
                    cache.invalidate(entry.block);
                    separator = new_sep;
                    left_child = new_left_block;
                    right_child = new_right_block;
                    continue;
                } else {
                    let new_block = cow_write_index(&mut state.storage, cache, entry.block, &node, key_size, block_size)?;
                    return propagate_replace(state, cache, path, new_block, key_size, block_size);
                }
            }
            None => {
                let new_level = last_level.map(|l| l + 1).unwrap_or(0);
                let new_root = IndexNode {
                    level: new_level,
                    begin_pointer: left_child,
                    entries: vec![IndexEntry {
                        key: separator,
                        pointer: right_child,
                    }],
                };
                let new_root_block = state.storage.reserve_block()?;
                write_index(&mut state.storage, cache, new_root_block, &new_root, key_size, block_size)?;
                state.pending_root.root_block = new_root_block;
                state.pending_root.root_is_leaf = false;
                state.pending_root.index_levels = new_level + 1;
                return Ok(());
            }
        }
    }
}

fn remove_impl(state: &mut State, cache: &IndexCache, key: &[u8], key_size: u32, block_size: u32) -> Result<bool> {
    let root = state.pending_root;
    let (mut path, leaf_block, mut leaf) = descend(&state.storage, cache, root, key_size, key)?;

    let i = match leaf.find_index(key) {
        Ok(i) => i,
        Err(_) => return Ok(false),
    };
    let removed = leaf.remove(i);
    free_tail_blocks(&mut state.storage, &removed)?;
    state.pending_root.record_count = state.pending_root.record_count.saturating_sub(1);

    let min_leaf_size = (block_size as f64 * crate::node::MIN_FILL_FRACTION) as usize;
    let underflowed = leaf.encoded_size(key_size as usize) < min_leaf_size;

    if underflowed && !path.is_empty() {
        rebalance_leaf(state, cache, &mut path, leaf_block, leaf, key_size, block_size)?;
    } else {
        let new_block = cow_write_leaf(&mut state.storage, leaf_block, &leaf, key_size, block_size)?;
        propagate_replace(state, cache, path, new_block, key_size, block_size)?;
    }

    collapse_root(state, cache, key_size)?;
    Ok(true)
}

/// Rewrite `leaf`'s parent (and, by `finish_parent`, every ancestor above
/// it) to a new block with an updated pointer, merging or redistributing
/// with a sibling first if `leaf` underflowed. Every block whose content
/// changes — `leaf`, a sibling, and each ancestor — is written to a freshly
/// reserved block; the old ones are freed once superseded, never reused.
fn rebalance_leaf(
    state: &mut State,
    cache: &IndexCache,
    path: &mut Vec<PathEntry>,
    leaf_block: u32,
    mut leaf: LeafNode,
    key_size: u32,
    block_size: u32,
) -> Result<()> {
    let parent_entry = path.pop().unwrap();
    let mut parent = (*load_index(&state.storage, cache, parent_entry.block, key_size)?).clone();
    let pos = parent_entry.child_pos;

    // Prefer the right sibling, falling back to the left.
    if pos + 1 < parent.pointer_count() {
        let right_block = parent.pointer(pos + 1);
        let mut right = read_leaf(&state.storage, right_block, key_size)?;
        let combined = leaf.entries_size(key_size as usize) + right.entries_size(key_size as usize);
        let header = leaf.encoded_size(key_size as usize) - leaf.entries_size(key_size as usize);
        if combined + header <= block_size as usize {
            // Merge right into left, free right's block, remove separator.
            let right_count = right.count();
            leaf.shift_left(&mut right, right_count);
            leaf.next_leaf = right.next_leaf;
            let new_block = cow_write_leaf(&mut state.storage, leaf_block, &leaf, key_size, block_size)?;
            state.storage.free_block(right_block)?;
            cache.invalidate(right_block);
            parent.update_pointer(pos, new_block);
            parent.remove_before(pos + 1);
        } else {
            let total = leaf.count() + right.count();
            let target = total / 2;
            let move_count = right.count().saturating_sub(target.saturating_sub(leaf.count()));
            if move_count > 0 && move_count <= right.count() {
                leaf.shift_left(&mut right, move_count);
                let new_left = cow_write_leaf(&mut state.storage, leaf_block, &leaf, key_size, block_size)?;
                let new_right = cow_write_leaf(&mut state.storage, right_block, &right, key_size, block_size)?;
                parent.update_pointer(pos, new_left);
                parent.update_pointer(pos + 1, new_right);
                parent.update_key_before(pos + 1, right.entries[0].key.clone());
            } else {
                let new_block = cow_write_leaf(&mut state.storage, leaf_block, &leaf, key_size, block_size)?;
                parent.update_pointer(pos, new_block);
            }
        }
    } else if pos > 0 {
        let left_block = parent.pointer(pos - 1);
        let mut left = read_leaf(&state.storage, left_block, key_size)?;
        let combined = leaf.entries_size(key_size as usize) + left.entries_size(key_size as usize);
        let header = leaf.encoded_size(key_size as usize) - leaf.entries_size(key_size as usize);
        if combined + header <= block_size as usize {
            let leaf_count = leaf.count();
            left.shift_left(&mut leaf, leaf_count);
            left.next_leaf = leaf.next_leaf;
            let new_block = cow_write_leaf(&mut state.storage, left_block, &left, key_size, block_size)?;
            state.storage.free_block(leaf_block)?;
            cache.invalidate(leaf_block);
            parent.update_pointer(pos - 1, new_block);
            parent.remove_before(pos);
        } else {
            let total = leaf.count() + left.count();
            let target = total / 2;
            let move_count = left.count().saturating_sub(target.saturating_sub(leaf.count()));
            if move_count > 0 && move_count <= left.count() {
                left.shift_right(&mut leaf, move_count);
                let new_left = cow_write_leaf(&mut state.storage, left_block, &left, key_size, block_size)?;
                let new_right = cow_write_leaf(&mut state.storage, leaf_block, &leaf, key_size, block_size)?;
                parent.update_pointer(pos - 1, new_left);
                parent.update_pointer(pos, new_right);
                parent.update_key_before(pos, leaf.entries[0].key.clone());
            } else {
                let new_block = cow_write_leaf(&mut state.storage, leaf_block, &leaf, key_size, block_size)?;
                parent.update_pointer(pos, new_block);
            }
        }
    } else {
        // Sole child: nothing to merge or redistribute with, just relocate.
        let new_block = cow_write_leaf(&mut state.storage, leaf_block, &leaf, key_size, block_size)?;
        parent.update_pointer(pos, new_block);
    }

    finish_parent(state, cache, std::mem::take(path), parent_entry.block, parent, key_size, block_size)
}

/// Rewrite `parent` to a new block and continue propagation: another
/// rebalance pass if it now underflows and has a grandparent to rebalance
/// against, otherwise a plain pointer-replace cascade to the root.
fn finish_parent(
    state: &mut State,
    cache: &IndexCache,
    mut path: Vec<PathEntry>,
    old_parent_block: u32,
    parent: IndexNode,
    key_size: u32,
    block_size: u32,
) -> Result<()> {
    if parent.needs_shift(key_size as usize, block_size as usize) && !path.is_empty() {
        rebalance_index(state, cache, &mut path, old_parent_block, parent, key_size, block_size)
    } else {
        let new_block = cow_write_index(&mut state.storage, cache, old_parent_block, &parent, key_size, block_size)?;
        propagate_replace(state, cache, path, new_block, key_size, block_size)
    }
}

fn rebalance_index(
    state: &mut State,
    cache: &IndexCache,
    path: &mut Vec<PathEntry>,
    node_block: u32,
    mut node: IndexNode,
    key_size: u32,
    block_size: u32,
) -> Result<()> {
    let Some(parent_entry) = path.pop() else {
        let new_block = cow_write_index(&mut state.storage, cache, node_block, &node, key_size, block_size)?;
        state.pending_root.root_block = new_block;
        return Ok(());
    };
    let mut parent = (*load_index(&state.storage, cache, parent_entry.block, key_size)?).clone();
    let pos = parent_entry.child_pos;

    if pos + 1 < parent.pointer_count() {
        let right_block = parent.pointer(pos + 1);
        let mut right = (*load_index(&state.storage, cache, right_block, key_size)?).clone();
        let mid = parent.key_before(pos + 1).to_vec();
        let combined =
            node.entries_size(key_size as usize) + right.entries_size(key_size as usize) + key_size as usize + 4;
        if combined + IndexNode::HEADER_SIZE <= block_size as usize {
            let right_move = right.pointer_count() - 1;
            node.shift_left(mid, &mut right, right_move);
            let new_block = cow_write_index(&mut state.storage, cache, node_block, &node, key_size, block_size)?;
            state.storage.free_block(right_block)?;
            cache.invalidate(right_block);
            parent.update_pointer(pos, new_block);
            parent.remove_before(pos + 1);
        } else {
            let total = node.pointer_count() + right.pointer_count();
            let target = total / 2;
            let move_count = right
                .pointer_count()
                .saturating_sub(target.saturating_sub(node.pointer_count()))
                .max(1)
                .min(right.entries.len());
            let new_sep = node.shift_left(mid, &mut right, move_count);
            let new_node_block = cow_write_index(&mut state.storage, cache, node_block, &node, key_size, block_size)?;
            let new_right_block = cow_write_index(&mut state.storage, cache, right_block, &right, key_size, block_size)?;
            parent.update_pointer(pos, new_node_block);
            parent.update_pointer(pos + 1, new_right_block);
            parent.update_key_before(pos + 1, new_sep);
        }
    } else if pos > 0 {
        let left_block = parent.pointer(pos - 1);
        let mut left = (*load_index(&state.storage, cache, left_block, key_size)?).clone();
        let mid = parent.key_before(pos).to_vec();
        let combined =
            node.entries_size(key_size as usize) + left.entries_size(key_size as usize) + key_size as usize + 4;
        if combined + IndexNode::HEADER_SIZE <= block_size as usize {
            let node_move = node.pointer_count() - 1;
            left.shift_left(mid, &mut node, node_move);
            let new_block = cow_write_index(&mut state.storage, cache, left_block, &left, key_size, block_size)?;
            state.storage.free_block(node_block)?;
            cache.invalidate(node_block);
            parent.update_pointer(pos - 1, new_block);
            parent.remove_before(pos);
        } else {
            let total = node.pointer_count() + left.pointer_count();
            let target = total / 2;
            let move_count = left
                .pointer_count()
                .saturating_sub(target.saturating_sub(node.pointer_count()))
                .max(1)
                .min(left.entries.len());
            let new_sep = left.shift_right(mid, &mut node, move_count);
            let new_left_block = cow_write_index(&mut state.storage, cache, left_block, &left, key_size, block_size)?;
            let new_node_block = cow_write_index(&mut state.storage, cache, node_block, &node, key_size, block_size)?;
            parent.update_pointer(pos - 1, new_left_block);
            parent.update_pointer(pos, new_node_block);
            parent.update_key_before(pos, new_sep);
        }
    } else {
        // Sole child: nothing to merge or redistribute with, just relocate.
        let new_block = cow_write_index(&mut state.storage, cache, node_block, &node, key_size, block_size)?;
        parent.update_pointer(pos, new_block);
    }

    finish_parent(state, cache, std::mem::take(path), parent_entry.block, parent, key_size, block_size)
}

/// Collapse a chain of single-child index roots down to the node that
/// actually has more than one child (or down to a leaf).
fn collapse_root(state: &mut State, cache: &IndexCache, key_size: u32) -> Result<()> {
    if state.pending_root.root_is_leaf {
        return Ok(());
    }
    loop {
        let root_block = state.pending_root.root_block;
        let node = load_index(&state.storage, cache, root_block, key_size)?;
        if node.pointer_count() != 1 {
            return Ok(());
        }
        let child = node.begin_pointer;
        let child_is_leaf = node.level == 0;
        state.storage.free_block(root_block)?;
        cache.invalidate(root_block);
        state.pending_root.root_block = child;
        state.pending_root.root_is_leaf = child_is_leaf;
        state.pending_root.index_levels = state.pending_root.index_levels.saturating_sub(1);
        if child_is_leaf {
            return Ok(());
        }
    }
}

fn collect_leaf_blocks(storage: &Storage, cache: &IndexCache, root: RootInfo, key_size: u32) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    collect_leaves_rec(storage, cache, root.root_block, root.root_is_leaf, key_size, &mut out)?;
    Ok(out)
}

fn collect_leaves_rec(
    storage: &Storage,
    cache: &IndexCache,
    block: u32,
    is_leaf: bool,
    key_size: u32,
    out: &mut Vec<u32>,
) -> Result<()> {
    if is_leaf {
        out.push(block);
        return Ok(());
    }
    let node = load_index(storage, cache, block, key_size)?;
    for i in 0..node.pointer_count() {
        collect_leaves_rec(storage, cache, node.pointer(i), node.level == 0, key_size, out)?;
    }
    Ok(())
}

fn count_node_kinds(storage: &Storage, cache: &IndexCache, root: RootInfo, key_size: u32) -> Result<(u32, u32)> {
    let mut index_count = 0u32;
    let mut leaf_count = 0u32;
    count_rec(storage, cache, root.root_block, root.root_is_leaf, key_size, &mut index_count, &mut leaf_count)?;
    Ok((index_count, leaf_count))
}

fn count_rec(
    storage: &Storage,
    cache: &IndexCache,
    block: u32,
    is_leaf: bool,
    key_size: u32,
    index_count: &mut u32,
    leaf_count: &mut u32,
) -> Result<()> {
    if is_leaf {
        *leaf_count += 1;
        return Ok(());
    }
    *index_count += 1;
    let node = load_index(storage, cache, block, key_size)?;
    for i in 0..node.pointer_count() {
        count_rec(storage, cache, node.pointer(i), node.level == 0, key_size, index_count, leaf_count)?;
    }
    Ok(())
}

fn collect_reachable_blocks(storage: &Storage, cache: &IndexCache, root: RootInfo, key_size: u32) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    collect_reachable_rec(storage, cache, root.root_block, root.root_is_leaf, key_size, &mut out)?;
    Ok(out)
}

fn collect_reachable_rec(
    storage: &Storage,
    cache: &IndexCache,
    block: u32,
    is_leaf: bool,
    key_size: u32,
    out: &mut Vec<u32>,
) -> Result<()> {
    out.push(block);
    if is_leaf {
        let leaf = read_leaf(storage, block, key_size)?;
        for e in &leaf.entries {
            out.extend(e.tail_blocks.iter().copied());
        }
        return Ok(());
    }
    let node = load_index(storage, cache, block, key_size)?;
    for i in 0..node.pointer_count() {
        collect_reachable_rec(storage, cache, node.pointer(i), node.level == 0, key_size, out)?;
    }
    Ok(())
}

/// Renumber every block in `reachable` into a contiguous prefix starting at
/// block 1 (block 0 stays the header), rewriting internal pointers, commit
/// the new root, and only then truncate the file — truncating before commit
/// would leave rollback unable to restore the blocks being dropped.
fn flatten(state: &mut State, cache: &IndexCache, reachable: &[u32], key_size: u32, block_size: u32) -> Result<()> {
    use std::collections::HashMap;

    let mut mapping: HashMap<u32, u32> = HashMap::new();
    for (i, &old) in reachable.iter().enumerate() {
        mapping.insert(old, i as u32 + 1);
    }

    let mut rewritten: HashMap<u32, Vec<u8>> = HashMap::new();
    for &old in reachable {
        let bytes = state.storage.read_block(old)?;
        let new_bytes = if is_leaf_block(&bytes) {
            let mut leaf = LeafNode::decode(&bytes, key_size as usize)?;
            if let Some(n) = leaf.next_leaf {
                leaf.next_leaf = Some(*mapping.get(&n).unwrap_or(&n));
            }
            for e in &mut leaf.entries {
                for t in &mut e.tail_blocks {
                    *t = *mapping.get(t).unwrap_or(t);
                }
            }
            leaf.encode(key_size as usize, block_size as usize)?
        } else {
            let mut node = IndexNode::decode(&bytes, key_size as usize)?;
            node.begin_pointer = *mapping.get(&node.begin_pointer).unwrap_or(&node.begin_pointer);
            for e in &mut node.entries {
                e.pointer = *mapping.get(&e.pointer).unwrap_or(&e.pointer);
            }
            node.encode(key_size as usize, block_size as usize)?
        };
        rewritten.insert(*mapping.get(&old).unwrap(), new_bytes);
    }

    for (&new_block, bytes) in &rewritten {
        state.storage.update_block(new_block, bytes)?;
    }

    let new_root_block = *mapping.get(&state.pending_root.root_block).unwrap();
    state.pending_root.root_block = new_root_block;
    state.storage.clear_free_index_chain();
    state.storage.commit(state.pending_root)?;
    state.storage.compact_truncate(reachable.len() as u32 + 1)?;
    cache.clear();
    Ok(())
}

fn is_leaf_block(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && &bytes[0..2] == b"LF"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_db(key_size: u32, block_size: u32) -> (Database, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bin");
        let mut db = Database::new("test", key_size);
        db.set_block_size(block_size);
        db.open(&path).unwrap();
        (db, dir)
    }

    #[test]
    fn insert_find_roundtrip() {
        let (db, _dir) = open_db(4, 256);
        assert!(!db.insert(b"key1", b"value-one").unwrap());
        assert_eq!(db.find(b"key1").unwrap(), Some(b"value-one".to_vec()));
        assert!(db.contains(b"key1").unwrap());
        assert!(!db.contains(b"key2").unwrap());
    }

    #[test]
    fn insert_overwrite_returns_true() {
        let (db, _dir) = open_db(4, 256);
        db.insert(b"key1", b"a").unwrap();
        assert!(db.insert(b"key1", b"b").unwrap());
        assert_eq!(db.find(b"key1").unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn remove_then_find_returns_none() {
        let (db, _dir) = open_db(4, 256);
        db.insert(b"key1", b"value").unwrap();
        assert!(db.remove(b"key1").unwrap());
        assert_eq!(db.find(b"key1").unwrap(), None);
        assert!(!db.remove(b"key1").unwrap());
    }

    #[test]
    fn range_scan_is_sorted() {
        let (db, _dir) = open_db(4, 256);
        for n in [b"cccc", b"aaaa", b"bbbb"] {
            db.insert(n, b"v").unwrap();
        }
        let results = db.find_range(b"aaaa", b"cccc").unwrap();
        let keys: Vec<_> = results.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"aaaa".to_vec(), b"bbbb".to_vec(), b"cccc".to_vec()]);
    }

    #[test]
    fn many_inserts_trigger_splits_and_stay_queryable() {
        let (db, _dir) = open_db(4, 128);
        for i in 0..200u32 {
            let key = i.to_be_bytes();
            db.insert(&key, b"v").unwrap();
        }
        assert_eq!(db.record_count(), 200);
        for i in 0..200u32 {
            let key = i.to_be_bytes();
            assert!(db.contains(&key).unwrap());
        }
        assert!(db.index_levels() >= 1);
    }

    #[test]
    fn rollback_discards_uncommitted_insert() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.bin");
        let mut db = Database::new("test", 4);
        db.set_block_size(256);
        db.set_auto_commit(false);
        db.open(&path).unwrap();

        db.insert(b"aaaa", b"one").unwrap();
        db.commit().unwrap();

        db.insert(b"bbbb", b"two").unwrap();
        assert_eq!(db.find(b"bbbb").unwrap(), Some(b"two".to_vec()));

        db.rollback().unwrap();
        assert_eq!(db.find(b"bbbb").unwrap(), None);
        assert_eq!(db.find(b"aaaa").unwrap(), Some(b"one".to_vec()));
    }
}
