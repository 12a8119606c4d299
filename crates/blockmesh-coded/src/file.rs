use blockmesh_config::{log_coded_debug, log_coded_warn, CodedConfig};
use blockmesh_store::BlockSource;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tracing::field::display;
use tracing::instrument;

use crate::stream::{read_length_prefix, BlobReader, BlobWriter};
use crate::{logical_blocks, BlockSealer, CodedError, KeyChain, Result, DEFAULT_SECRET};

/// Tunables for a [`CodedBlockStore`].
#[derive(Clone)]
pub struct CodedOptions {
    /// Physical copies of each logical block
    pub num_replicas: usize,
    /// Removals in flight during [`File::delete`]
    pub delete_concurrency: usize,
    /// HMAC key for block tags
    pub secret: Vec<u8>,
}

impl std::fmt::Debug for CodedOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodedOptions")
            .field("num_replicas", &self.num_replicas)
            .field("delete_concurrency", &self.delete_concurrency)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Default for CodedOptions {
    fn default() -> Self {
        Self {
            num_replicas: 2,
            delete_concurrency: 16,
            secret: DEFAULT_SECRET.to_vec(),
        }
    }
}

impl CodedOptions {
    pub fn from_config(cfg: &CodedConfig) -> Self {
        Self {
            num_replicas: cfg.num_replicas,
            delete_concurrency: cfg.delete_concurrency,
            ..Self::default()
        }
    }

    pub fn with_replicas(mut self, num_replicas: usize) -> Self {
        self.num_replicas = num_replicas;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.secret = secret.into();
        self
    }
}

/// Outcome of [`File::delete`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    /// Physical blocks removed
    pub removed: usize,
    /// Chain positions that held nothing (reserved replica slots)
    pub missing: usize,
    /// Keys whose removal failed for another reason; retry with
    /// [`BlockSource::remove`]
    pub failed: Vec<String>,
}

/// Blob storage over a [`BlockSource`].
#[derive(Debug)]
pub struct CodedBlockStore<S> {
    backing: S,
    sealer: BlockSealer,
    num_replicas: usize,
    delete_concurrency: usize,
}

impl<S: BlockSource> CodedBlockStore<S> {
    pub fn new(backing: S, options: CodedOptions) -> Result<Self> {
        Ok(Self {
            backing,
            sealer: BlockSealer::new(&options.secret)?,
            num_replicas: options.num_replicas.max(1),
            delete_concurrency: options.delete_concurrency.max(1),
        })
    }

    pub fn backing(&self) -> &S {
        &self.backing
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    /// Handle for the blob called `name`. Nothing is read or written until
    /// one of its operations runs.
    pub fn file(&self, name: impl Into<String>) -> File<'_, S> {
        File {
            store: self,
            name: name.into(),
        }
    }

    /// Write `payload` sealed under every key in `keys`, concurrently.
    ///
    /// Every copy runs to completion before the first error is reported, so
    /// no write is abandoned halfway while the caller moves on.
    pub(crate) async fn write_replicas(&self, name: &str, keys: &[String], payload: &[u8]) -> Result<()> {
        let results = join_all(keys.iter().map(|key| async move {
            let block = self.sealer.seal(name, key, payload);
            self.backing.store(key, &block).await
        }))
        .await;
        for result in results {
            result?;
        }
        log_coded_debug!(
            "Wrote logical block",
            name = name,
            len = payload.len(),
            copies = keys.len()
        );
        Ok(())
    }

    async fn fetch_physical(&self, name: &str, key: &str) -> Result<Vec<u8>> {
        let block = self.backing.get(key).await?;
        let payload = self.sealer.open(name, key, &block)?;
        Ok(payload.to_vec())
    }

    /// Read the next logical block from `keys`: the first replica that
    /// exists and authenticates wins, and the chain is advanced past the
    /// remaining replica slots either way.
    ///
    /// When every replica failed inside the backing store (not a missing or
    /// rejected block) the store's error is returned as is.
    pub(crate) async fn fetch_logical(
        &self,
        name: &str,
        keys: &mut KeyChain,
        logical_block: u64,
    ) -> Result<Vec<u8>> {
        let mut last = None;
        let mut store_faults = 0;
        for attempt in 0..self.num_replicas {
            let key = keys.next_key();
            match self.fetch_physical(name, &key).await {
                Ok(payload) => {
                    keys.skip_keys(self.num_replicas - attempt - 1);
                    return Ok(payload);
                }
                Err(e @ CodedError::AuthenticationError { .. })
                | Err(e @ CodedError::InvalidBlockFormat { .. }) => {
                    log_coded_warn!(
                        "Rejected replica",
                        name = name,
                        logical_block = logical_block,
                        attempt = attempt,
                        error = display(&e)
                    );
                    last = Some(e);
                }
                Err(e) => {
                    log_coded_debug!(
                        "Replica unavailable",
                        name = name,
                        logical_block = logical_block,
                        attempt = attempt,
                        error = display(&e)
                    );
                    if matches!(&e, CodedError::UnderlyingStoreError(inner) if !inner.is_not_found()) {
                        store_faults += 1;
                    }
                    last = Some(e);
                }
            }
        }

        match last {
            Some(e @ CodedError::UnderlyingStoreError(_)) if store_faults == self.num_replicas => Err(e),
            last => Err(CodedError::BlockUnavailable {
                logical_block,
                attempts: self.num_replicas,
                last: last.map(Box::new),
            }),
        }
    }
}

/// A named blob. Names are only seeds for the key chain; there is no
/// directory structure behind them.
#[derive(Debug)]
pub struct File<'a, S> {
    store: &'a CodedBlockStore<S>,
    name: String,
}

impl<S> Clone for File<'_, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store,
            name: self.name.clone(),
        }
    }
}

impl<'a, S: BlockSource> File<'a, S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn store(&self) -> &'a CodedBlockStore<S> {
        self.store
    }

    /// Start writing the blob, replacing whatever was stored under this
    /// name once [`BlobWriter::finish`] lands.
    pub fn write_stream(&self) -> BlobWriter<'a, S> {
        BlobWriter::new(self.clone())
    }

    /// Open the blob for reading. Fetches logical block 0 to learn the
    /// length.
    pub async fn read_stream(&self) -> Result<BlobReader<'a, S>> {
        BlobReader::open(self.clone()).await
    }

    /// Read the whole blob into memory.
    pub async fn read_all(&self) -> Result<Vec<u8>> {
        let mut reader = self.read_stream().await?;
        let mut data = Vec::with_capacity(reader.len() as usize);
        while let Some(chunk) = reader.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// Remove every physical block of the blob, including unwritten replica
    /// slots. Per-key failures are collected in the report, not fatal.
    #[instrument(skip(self), fields(name = %self.name), level = "debug")]
    pub async fn delete(&self) -> Result<DeleteReport> {
        let mut keys = KeyChain::new(self.name.as_str());
        let first = self.store.fetch_logical(&self.name, &mut keys, 0).await?;
        let (length, _) = read_length_prefix(&first)?;
        let total = logical_blocks(length) as usize * self.store.num_replicas;

        let backing = &self.store.backing;
        let report = stream::iter(KeyChain::new(self.name.as_str()).take(total))
            .map(|key| async move {
                let result = backing.remove(&key).await;
                (key, result)
            })
            .buffer_unordered(self.store.delete_concurrency)
            .fold(DeleteReport::default(), |mut report, (key, result)| async move {
                match result {
                    Ok(()) => report.removed += 1,
                    Err(e) if e.is_not_found() => report.missing += 1,
                    Err(e) => {
                        log_coded_warn!(
                            "Failed to remove block",
                            key = key.as_str(),
                            error = display(&e)
                        );
                        report.failed.push(key);
                    }
                }
                report
            })
            .await;

        log_coded_debug!(
            "Deleted blob",
            name = self.name.as_str(),
            removed = report.removed,
            missing = report.missing,
            failed = report.failed.len()
        );
        Ok(report)
    }
}
