//! # blockmesh-store
//!
//! Disk-backed block storage shared by many users, each confined to its own
//! quota and key namespace.
//!
//! ## Directory Layout
//!
//! ```text
//! <root>/
//! ├── .id                 # persistent store identity (random hex)
//! ├── usera$0123          # block "0123" owned by uid "usera"
//! ├── usera$9f2c...
//! └── userb$0123          # same key, different owner, different file
//! ```
//!
//! Consumers never see physical names: an [`Accessor`] binds one uid and
//! exchanges only the unscoped hex key. Everything a consumer can do goes
//! through the [`BlockSource`] / [`ScopedStore`] capability traits, which
//! routing layers implement as well.

mod accessor;
mod ledger;
mod scan;
mod source;
mod store;

pub use accessor::Accessor;
pub use blockmesh_config::OverwritePolicy;
pub use ledger::{Hold, Ledger};
pub use scan::{spawn_scanner, ScanEvent, ScanPacing, ScannerHandle, StopHandle};
pub use source::{BlockSource, KeyStream, ScopedStore};
pub use store::{BlockStore, BlockStoreOptions};

use std::io;

use thiserror::Error;

/// Largest block accepted on the wire (16 KiB).
pub const MAX_BLOCK_SIZE: usize = 16384;

/// Sentinel file holding the store identity.
pub const ID_FILE: &str = ".id";

/// Separates the owner uid from the key in physical file names.
pub const UID_SEPARATOR: char = '$';

/// Errors that can occur during block store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid key: {key:?}")]
    InvalidKey { key: String },

    #[error("Invalid uid: {uid:?}")]
    InvalidUid { uid: String },

    #[error("Attempted to write oversized block ({len} > {max})")]
    OversizedBlock { len: usize, max: usize },

    #[error("Store full for {uid}: {used} used + {requested} requested > {capacity}")]
    StoreFull {
        uid: String,
        used: u64,
        requested: u64,
        capacity: u64,
    },

    #[error("Block not found: {key}")]
    NotFound { key: String },

    #[error("Refusing to overwrite existing block: {key}")]
    OverwriteRefused { key: String },

    #[error("UID of accessor doesn't match ({actual} != {expected})")]
    UidMismatch { expected: String, actual: String },

    #[error("Store {id} is already a ring member")]
    DuplicateStore { id: String },

    #[error("No block stores available")]
    EmptyRing,

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Keys are non-empty hexadecimal strings.
#[inline]
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Fail with `InvalidKey` unless `key` is hex.
pub fn validate_key(key: &str) -> Result<()> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(StoreError::InvalidKey {
            key: key.to_string(),
        })
    }
}

/// A uid becomes a file name prefix, so it must not be able to escape the
/// store directory, hide as a dotfile, or contain the separator.
pub fn is_valid_uid(uid: &str) -> bool {
    !uid.is_empty()
        && !uid.starts_with('.')
        && !uid
            .chars()
            .any(|c| c == UID_SEPARATOR || c == '/' || c == '\\' || c == '\0')
}

pub fn validate_uid(uid: &str) -> Result<()> {
    if is_valid_uid(uid) {
        Ok(())
    } else {
        Err(StoreError::InvalidUid {
            uid: uid.to_string(),
        })
    }
}

/// Physical file name for `key` owned by `uid`.
pub fn physical_key(uid: &str, key: &str) -> String {
    format!("{}{}{}", uid, UID_SEPARATOR, key)
}

/// Split a physical file name back into `(uid, key)`.
///
/// Returns `None` for anything that is not a well-formed block name,
/// including the identity sentinel and temporary files.
pub fn parse_physical_key(name: &str) -> Option<(&str, &str)> {
    let (uid, key) = name.split_once(UID_SEPARATOR)?;
    if is_valid_uid(uid) && is_valid_key(key) {
        Some((uid, key))
    } else {
        None
    }
}
