use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blockmesh_config::{log_store_debug, log_store_info, log_store_warn, StorageConfig};
use futures::stream::BoxStream;
use tokio::io::AsyncWriteExt;
use tracing::field::display;
use tracing::instrument;
use walkdir::WalkDir;

use crate::scan::{scan_blocks, scan_keys, ScanPacing};
use crate::{
    parse_physical_key, physical_key, validate_key, validate_uid, Accessor, KeyStream, Ledger,
    OverwritePolicy, Result, StoreError, ID_FILE, MAX_BLOCK_SIZE,
};

/// Sequence for unique temporary file names within this process.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Tuning for one block store.
#[derive(Debug, Clone)]
pub struct BlockStoreOptions {
    /// Capacity in bytes (default: 128MB)
    pub capacity: u64,
    /// What to do when a key already exists (default: allow)
    pub overwrite: OverwritePolicy,
    /// Pause between paced scan batches (default: 100ms)
    pub scan_interval: Duration,
    /// Keys per scan batch (default: 64)
    pub scan_batch: usize,
}

impl Default for BlockStoreOptions {
    fn default() -> Self {
        Self {
            capacity: 128 << 20,
            overwrite: OverwritePolicy::Allow,
            scan_interval: Duration::from_millis(100),
            scan_batch: 64,
        }
    }
}

impl BlockStoreOptions {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            capacity: config.capacity,
            overwrite: config.overwrite,
            scan_interval: Duration::from_millis(config.scan_interval_ms),
            scan_batch: config.scan_batch.max(1),
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_overwrite(mut self, overwrite: OverwritePolicy) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub(crate) fn pacing(&self) -> ScanPacing {
        ScanPacing {
            interval: self.scan_interval,
            batch: self.scan_batch.max(1),
        }
    }
}

/// A directory of blocks belonging to any number of uids.
///
/// One process is expected to own a store directory; concurrent writers in
/// other processes are not coordinated with.
#[derive(Debug)]
pub struct BlockStore {
    root: PathBuf,
    id: String,
    options: BlockStoreOptions,
    ledger: Ledger,
}

/// What the startup walk found.
#[derive(Debug, Default)]
struct Rebuild {
    blocks: u64,
    bytes: u64,
    ignored: u64,
    stale_temps: u64,
}

impl BlockStore {
    /// Open (or create) the store at `root`.
    ///
    /// Creates the directory, loads or mints the persistent id, removes
    /// temporaries left behind by a crash, and rebuilds the per-uid ledger
    /// from the sizes of the block files already present.
    #[instrument(skip(root, options), fields(root = %root.as_ref().display()))]
    pub async fn open(root: impl AsRef<Path>, options: BlockStoreOptions) -> Result<Arc<Self>> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        let id = load_or_create_id(&root).await?;

        let walk_root = root.clone();
        let (ledger, rebuild) = tokio::task::spawn_blocking(move || rebuild_ledger(&walk_root))
            .await
            .map_err(io::Error::other)??;

        log_store_info!(
            "Block store opened",
            store_id = id.as_str(),
            root = display(root.display()),
            blocks = rebuild.blocks,
            bytes = rebuild.bytes,
            ignored = rebuild.ignored,
            stale_temps = rebuild.stale_temps,
        );

        Ok(Arc::new(Self {
            root,
            id,
            options,
            ledger,
        }))
    }

    /// Open a store described by configuration.
    pub async fn open_with_config(config: &StorageConfig) -> Result<Arc<Self>> {
        Self::open(config.resolved_root(), BlockStoreOptions::from_config(config)).await
    }

    /// Persistent identity; the store's position on a ring.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &BlockStoreOptions {
        &self.options
    }

    /// Total configured capacity, shared by every uid.
    pub fn size(&self) -> u64 {
        self.options.capacity
    }

    /// Usage of every uid on this store.
    pub fn quota(&self) -> HashMap<String, u64> {
        self.ledger.snapshot()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// A view restricted to `uid`.
    pub fn accessor(self: &Arc<Self>, uid: &str) -> Result<Accessor> {
        validate_uid(uid)?;
        Ok(Accessor::new(Arc::clone(self), uid.to_string()))
    }

    fn block_path(&self, uid: &str, key: &str) -> PathBuf {
        self.root.join(physical_key(uid, key))
    }

    /// Retrieve the block `key` owned by `uid`.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, uid: &str, key: &str) -> Result<Vec<u8>> {
        validate_uid(uid)?;
        validate_key(key)?;
        tokio::fs::read(self.block_path(uid, key))
            .await
            .map_err(|e| not_found_or_io(e, key))
    }

    /// Store `block` under `key` for `uid` and return the size delta.
    ///
    /// The ledger is charged before the write and refunded if the write
    /// fails or the call is dropped before it completes. Replacing an existing block charges only the difference.
    #[instrument(skip(self, block), fields(len = block.len()), level = "debug")]
    pub async fn store(&self, uid: &str, key: &str, block: &[u8]) -> Result<i64> {
        validate_uid(uid)?;
        validate_key(key)?;
        if block.len() > MAX_BLOCK_SIZE {
            return Err(StoreError::OversizedBlock {
                len: block.len(),
                max: MAX_BLOCK_SIZE,
            });
        }

        let len = block.len() as u64;
        let used = self.ledger.usage(uid);
        if used + len > self.options.capacity {
            return Err(StoreError::StoreFull {
                uid: uid.to_string(),
                used,
                requested: len,
                capacity: self.options.capacity,
            });
        }

        let path = self.block_path(uid, key);
        let previous = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                if self.options.overwrite == OverwritePolicy::Refuse {
                    return Err(StoreError::OverwriteRefused {
                        key: key.to_string(),
                    });
                }
                meta.len()
            }
            Ok(_) => 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let delta = len as i64 - previous as i64;
        let hold = self.ledger.hold(uid, delta);

        if let Err(e) = self.write_atomic(&path, block).await {
            drop(hold);
            log_store_warn!(
                "Block write failed, ledger compensated",
                key = key,
                error = display(&e),
            );
            return Err(e.into());
        }
        hold.commit();

        log_store_debug!("Block stored", uid = uid, key = key, delta = delta);
        Ok(delta)
    }

    /// Delete `key` for `uid`, refunding the bytes that were on disk.
    #[instrument(skip(self), level = "debug")]
    pub async fn remove(&self, uid: &str, key: &str) -> Result<()> {
        validate_uid(uid)?;
        validate_key(key)?;
        let path = self.block_path(uid, key);
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_io(e, key))?
            .len();
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or_io(e, key))?;
        self.ledger.refund(uid, size);
        log_store_debug!("Block removed", uid = uid, key = key, bytes = size);
        Ok(())
    }

    /// Paced pass over every key owned by `uid`.
    pub fn scan_once(&self, uid: &str) -> KeyStream<'static> {
        scan_keys(self.root.clone(), uid.to_string(), self.options.pacing())
    }

    /// Paced pass over every block on the store, whoever owns it. Yields
    /// `(uid, key)` pairs; fetch contents with [`BlockStore::get`].
    pub fn scan_all(&self) -> BoxStream<'static, Result<(String, String)>> {
        scan_blocks(self.root.clone(), None, self.options.pacing())
    }

    /// Write through a dot-prefixed temporary and rename into place, so a
    /// block name never refers to a partially written file.
    async fn write_atomic(&self, path: &Path, block: &[u8]) -> io::Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = self.root.join(format!(
            ".{}.{}.{}.tmp",
            file_name,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let result = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(block).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, path).await
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
        result
    }
}

fn not_found_or_io(e: io::Error, key: &str) -> StoreError {
    if e.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound {
            key: key.to_string(),
        }
    } else {
        StoreError::Io(e)
    }
}

async fn load_or_create_id(root: &Path) -> Result<String> {
    let id_path = root.join(ID_FILE);
    match tokio::fs::read_to_string(&id_path).await {
        Ok(contents) => {
            let id = contents.trim();
            if !id.is_empty() && id.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Ok(id.to_string());
            }
            log_store_warn!("Ignoring malformed store id", path = display(id_path.display()));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let id = hex::encode(rand::random::<[u8; 16]>());
    tokio::fs::write(&id_path, &id).await?;
    log_store_info!("Minted new store id", store_id = id.as_str());
    Ok(id)
}

fn rebuild_ledger(root: &Path) -> Result<(Ledger, Rebuild)> {
    let ledger = Ledger::new();
    let mut rebuild = Rebuild::default();

    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();

        if name.starts_with('.') {
            if name.ends_with(".tmp") {
                std::fs::remove_file(entry.path())?;
                rebuild.stale_temps += 1;
            }
            continue;
        }

        match parse_physical_key(&name) {
            Some((uid, _key)) => {
                let size = entry.metadata().map_err(io::Error::from)?.len();
                ledger.charge(uid, size);
                rebuild.blocks += 1;
                rebuild.bytes += size;
            }
            None => {
                log_store_debug!("Ignoring foreign file", name = &*name);
                rebuild.ignored += 1;
            }
        }
    }

    Ok((ledger, rebuild))
}
