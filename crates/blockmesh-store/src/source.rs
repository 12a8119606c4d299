//! Capability traits every storage layer speaks.
//!
//! Restricted views are built by delegation: an [`Accessor`](crate::Accessor)
//! wraps a [`BlockStore`](crate::BlockStore), a ring wraps accessors, a coded
//! store wraps a ring. Each layer only needs the trait below it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::Result;

/// Lazy, paced sequence of unscoped keys. Dropping it stops the scan.
pub type KeyStream<'a> = BoxStream<'a, Result<String>>;

/// The minimal get/store/remove contract.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch a block.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Store a block, returning the signed change in bytes on disk
    /// (new size minus the size of any block it replaced).
    async fn store(&self, key: &str, block: &[u8]) -> Result<i64>;

    /// Delete a block.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// A uid-scoped store that can take part in a ring: it has an identity,
/// reports usage and capacity, and can enumerate what it holds.
#[async_trait]
pub trait ScopedStore: BlockSource {
    /// Identity of the backing store; its position on the ring.
    fn id(&self) -> &str;

    /// The uid this view is bound to.
    async fn uid(&self) -> Result<String>;

    /// Bytes currently attributed to the bound uid.
    async fn quota(&self) -> Result<u64>;

    /// Capacity of the backing store, shared across all uids on it.
    async fn size(&self) -> Result<u64>;

    /// One pass over every key owned by the bound uid. Not a snapshot:
    /// concurrent mutations may or may not be observed.
    fn scan_once(&self) -> KeyStream<'_>;
}

#[async_trait]
impl<T: BlockSource + ?Sized> BlockSource for Arc<T> {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        (**self).get(key).await
    }

    async fn store(&self, key: &str, block: &[u8]) -> Result<i64> {
        (**self).store(key, block).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key).await
    }
}
