use thiserror::Error;

/// Errors produced by the storage engine.
///
/// Every variant that can be attributed to a specific on-disk block carries
/// that block's index, and every variant names the operation that failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An operation was attempted before `open()` succeeded, or after `close()`.
    #[error("database is not open")]
    NotOpen,

    /// A caller-supplied parameter was invalid, e.g. a key of the wrong size,
    /// or an attempt to change a parameter after the database is open.
    #[error("bad parameter in `{op}`: {detail}")]
    BadParameter { op: &'static str, detail: String },

    /// The underlying device failed a read or write.
    #[error("device error during `{op}`{}", block.map(|b| format!(" at block {b}")).unwrap_or_default())]
    Device {
        op: &'static str,
        block: Option<u32>,
        #[source]
        source: std::io::Error,
    },

    /// On-disk structure didn't match what the descent/codec expected: bad
    /// magic, an out-of-range pointer, a level mismatch, a node that would
    /// overflow a block, or recursion past the recorded tree depth.
    #[error("database corruption during `{op}`{}: {detail}", block.map(|b| format!(" at block {b}")).unwrap_or_default())]
    Corruption {
        op: &'static str,
        block: Option<u32>,
        detail: String,
    },

    /// Opening an existing file whose header doesn't match the configured
    /// `blockSize` / `keySize` / `contentIdentifier`. Unrecoverable: the
    /// caller must create a fresh file.
    #[error("existing database parameters do not match: {0}")]
    ParameterMismatch(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt(op: &'static str, block: Option<u32>, detail: impl Into<String>) -> Self {
        Error::Corruption {
            op,
            block,
            detail: detail.into(),
        }
    }

    pub(crate) fn bad_param(op: &'static str, detail: impl Into<String>) -> Self {
        Error::BadParameter {
            op,
            detail: detail.into(),
        }
    }

    pub(crate) fn device(op: &'static str, block: Option<u32>, source: std::io::Error) -> Self {
        Error::Device { op, block, source }
    }
}
