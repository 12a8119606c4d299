use std::sync::Arc;

use async_trait::async_trait;

use crate::scan::{spawn_scanner, ScanEvent, ScannerHandle, StopHandle};
use crate::{BlockSource, BlockStore, KeyStream, Result, ScopedStore};

/// A uid-scoped view over one [`BlockStore`].
///
/// Every operation is confined to keys prefixed with the bound uid; other
/// users' blocks can be neither read, overwritten, nor enumerated.
#[derive(Debug, Clone)]
pub struct Accessor {
    store: Arc<BlockStore>,
    uid: String,
}

impl Accessor {
    pub(crate) fn new(store: Arc<BlockStore>, uid: String) -> Self {
        Self { store, uid }
    }

    /// The bound uid.
    pub fn getuid(&self) -> &str {
        &self.uid
    }

    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    /// Background maintenance scan: re-runs [`ScopedStore::scan_once`] until
    /// the handler or the returned handle stops it. Passes are spaced by the
    /// store's scan interval.
    pub fn scanner<F>(&self, handler: F) -> ScannerHandle
    where
        F: FnMut(ScanEvent, &StopHandle) + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let uid = self.uid.clone();
        spawn_scanner(
            move || store.scan_once(&uid),
            self.store.options().scan_interval,
            handler,
        )
    }
}

#[async_trait]
impl BlockSource for Accessor {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.store.get(&self.uid, key).await
    }

    async fn store(&self, key: &str, block: &[u8]) -> Result<i64> {
        self.store.store(&self.uid, key, block).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.store.remove(&self.uid, key).await
    }
}

#[async_trait]
impl ScopedStore for Accessor {
    fn id(&self) -> &str {
        self.store.id()
    }

    async fn uid(&self) -> Result<String> {
        Ok(self.uid.clone())
    }

    async fn quota(&self) -> Result<u64> {
        Ok(self.store.ledger().usage(&self.uid))
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.store.size())
    }

    fn scan_once(&self) -> KeyStream<'_> {
        self.store.scan_once(&self.uid)
    }
}
