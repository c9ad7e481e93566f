//! Block-structured B-tree key/value store with copy-on-write allocation and
//! dual-root atomic commit: a single-file, single-writer-multiple-reader
//! storage engine.

mod cache;
mod device;
mod error;
mod hashed;
mod header;
mod node;
mod storage;
mod tree;

pub use error::{Error, Result};
pub use hashed::HashedDatabase;
pub use tree::Database;
