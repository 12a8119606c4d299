//! # blockmesh-coded
//!
//! Arbitrarily large named blobs over any [`BlockSource`]: cut into
//! logical blocks, replicated, and authenticated with a per-block tag.
//!
//! ## Physical Layout
//!
//! ```text
//! chain:  k0 k1 .. k(r-1) | kr .. k(2r-1) | ... (r = num_replicas)
//!         logical 0       | logical 1     | ...
//!
//! logical 0 payload:  len (u32 LE) ‖ up to 16348 bytes of data
//! logical n payload:  up to 16352 bytes of data
//! physical block:     payload ‖ HMAC-SHA256 tag (32 bytes)
//! ```
//!
//! Keys come from a [`KeyChain`] seeded with the blob name, so there is no
//! directory: the name alone locates every block. Logical block 0 is
//! written last, once the total length is known, and read first.
//!
//! Blocks are authenticated but not encrypted. Unless a secret is
//! configured, every store shares [`DEFAULT_SECRET`]; anyone with that
//! constant can forge blocks, so real deployments must set their own.

mod chain;
mod file;
mod stream;
mod tag;

pub use chain::KeyChain;
pub use file::{CodedBlockStore, CodedOptions, DeleteReport, File};
pub use stream::{BlobReader, BlobWriter};
pub use tag::BlockSealer;

pub use blockmesh_store::BlockSource;

use blockmesh_store::{StoreError, MAX_BLOCK_SIZE};
use thiserror::Error;

/// Authentication trailer on every physical block.
pub const TAG_SIZE: usize = 32;

/// Length prefix carried by logical block 0.
pub const LENGTH_PREFIX: usize = 4;

/// Data bytes in every logical block after the first.
pub const BLOCK_DATA: usize = MAX_BLOCK_SIZE - TAG_SIZE;

/// Data bytes in logical block 0.
pub const FIRST_BLOCK_DATA: usize = BLOCK_DATA - LENGTH_PREFIX;

/// Longest blob the length prefix can describe.
pub const MAX_BLOB_LEN: u64 = u32::MAX as u64;

/// Shared default HMAC secret.
pub const DEFAULT_SECRET: &[u8] = b"1234";

/// Errors from blob operations
#[derive(Error, Debug)]
pub enum CodedError {
    #[error("Invalid block format: {reason}")]
    InvalidBlockFormat { reason: String },

    #[error("Block HMAC mismatch for {key}")]
    AuthenticationError { key: String },

    #[error("Error reading block {logical_block}: all {attempts} replicas failed")]
    BlockUnavailable {
        logical_block: u64,
        attempts: usize,
        /// Failure of the last replica tried
        #[source]
        last: Option<Box<CodedError>>,
    },

    #[error("Block store error: {0}")]
    UnderlyingStoreError(#[from] StoreError),

    #[error("Blob too large: {len} > {max} bytes")]
    BlobTooLarge { len: u64, max: u64 },

    #[error("Blob truncated: expected {expected} bytes, found {actual}")]
    TruncatedBlob { expected: u64, actual: u64 },

    #[error("Secret cannot key HMAC-SHA256")]
    InvalidSecret,
}

pub type Result<T> = std::result::Result<T, CodedError>;

/// Logical blocks holding a blob of `len` bytes (at least one, for the
/// length prefix).
pub fn logical_blocks(len: u64) -> u64 {
    (len + LENGTH_PREFIX as u64).div_ceil(BLOCK_DATA as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_geometry() {
        assert_eq!(BLOCK_DATA, 16352);
        assert_eq!(FIRST_BLOCK_DATA, 16348);
        assert_eq!(FIRST_BLOCK_DATA + LENGTH_PREFIX + TAG_SIZE, MAX_BLOCK_SIZE);
    }

    #[test]
    fn test_logical_block_count() {
        assert_eq!(logical_blocks(0), 1);
        assert_eq!(logical_blocks(FIRST_BLOCK_DATA as u64), 1);
        assert_eq!(logical_blocks(FIRST_BLOCK_DATA as u64 + 1), 2);
        assert_eq!(logical_blocks((FIRST_BLOCK_DATA + BLOCK_DATA) as u64), 2);
        assert_eq!(logical_blocks((FIRST_BLOCK_DATA + BLOCK_DATA) as u64 + 1), 3);
    }
}
