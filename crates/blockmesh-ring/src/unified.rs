use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use blockmesh_config::{log_ring_debug, log_ring_error, log_ring_info, log_ring_warn, RingConfig};
use blockmesh_store::{
    validate_key, validate_uid, BlockSource, Ledger, Result, ScopedStore, StoreError,
    MAX_BLOCK_SIZE,
};
use futures::stream::{self, StreamExt};
use tracing::field::display;
use tracing::instrument;

use crate::placement::{placement_hash, predecessor, select};

type Member = Arc<dyn ScopedStore>;

/// Tunables for a [`UnifiedBlockStore`].
#[derive(Debug, Clone)]
pub struct RingOptions {
    /// Migrations in flight during relocation
    pub relocation_concurrency: usize,
}

impl Default for RingOptions {
    fn default() -> Self {
        Self {
            relocation_concurrency: 8,
        }
    }
}

impl RingOptions {
    pub fn from_config(cfg: &RingConfig) -> Self {
        Self {
            relocation_concurrency: cfg.relocation_concurrency.max(1),
        }
    }
}

/// Outcome of the relocation pass run by [`UnifiedBlockStore::add`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelocationReport {
    /// Keys visited on the scanned members
    pub scanned: usize,
    /// Keys migrated to their owner
    pub moved: usize,
    /// Migrations (or scans) that failed; the block stays where it was
    pub failed: usize,
}

/// Many uid-scoped stores presented as one, with keys spread over a
/// consistent-hash ring of member ids.
///
/// The aggregate ledger and capacity are the sums of the members'. Members
/// may live on different disks or behind a transport; the ring only needs
/// the [`ScopedStore`] capability.
pub struct UnifiedBlockStore {
    uid: String,
    members: RwLock<BTreeMap<String, Member>>,
    ledger: Ledger,
    capacity: AtomicU64,
    options: RingOptions,
}

impl std::fmt::Debug for UnifiedBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedBlockStore")
            .field("uid", &self.uid)
            .field("members", &self.members())
            .field("quota", &self.quota())
            .field("size", &self.size())
            .finish()
    }
}

impl UnifiedBlockStore {
    pub fn new(uid: impl Into<String>, options: RingOptions) -> Result<Self> {
        let uid = uid.into();
        validate_uid(&uid)?;
        Ok(Self {
            uid,
            members: RwLock::new(BTreeMap::new()),
            ledger: Ledger::new(),
            capacity: AtomicU64::new(0),
            options,
        })
    }

    pub fn with_config(uid: impl Into<String>, cfg: &RingConfig) -> Result<Self> {
        Self::new(uid, RingOptions::from_config(cfg))
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Bytes attributed to this uid across every member.
    pub fn quota(&self) -> u64 {
        self.ledger.usage(&self.uid)
    }

    /// Combined capacity of every member.
    pub fn size(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Member ids in ring order.
    pub fn members(&self) -> Vec<String> {
        self.read_members().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read_members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_members().is_empty()
    }

    /// Id of the member that owns `key`, if the ring has any members.
    pub fn owner_of(&self, key: &str) -> Option<String> {
        let hash = placement_hash(key);
        select(&self.read_members(), &hash).map(|(id, _)| id.clone())
    }

    /// Join `member` to the ring and move blocks the new membership assigns
    /// elsewhere.
    ///
    /// The member's quota and capacity are folded into the aggregate first.
    /// Relocation then scans the new member's predecessor and the member
    /// itself; a failed migration is logged and counted but does not fail
    /// the call.
    #[instrument(skip(self, member), fields(uid = %self.uid, id = member.id()), level = "debug")]
    pub async fn add(&self, member: Member) -> Result<RelocationReport> {
        let member_uid = member.uid().await?;
        if member_uid != self.uid {
            return Err(StoreError::UidMismatch {
                expected: self.uid.clone(),
                actual: member_uid,
            });
        }
        let quota = member.quota().await?;
        let capacity = member.size().await?;
        let id = member.id().to_string();

        let neighbor = {
            let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
            if members.contains_key(&id) {
                return Err(StoreError::DuplicateStore { id });
            }
            members.insert(id.clone(), Arc::clone(&member));
            self.ledger.charge(&self.uid, quota);
            self.capacity.fetch_add(capacity, Ordering::AcqRel);
            predecessor(&members, &id).map(|(_, m)| Arc::clone(m))
        };

        log_ring_info!(
            "Store joined ring",
            id = id.as_str(),
            members = self.len(),
            quota = quota,
            capacity = capacity
        );

        let mut report = RelocationReport::default();
        if let Some(neighbor) = neighbor {
            self.relocate(&neighbor, &mut report).await;
            self.relocate(&member, &mut report).await;
        }

        if report.moved > 0 || report.failed > 0 {
            log_ring_info!(
                "Relocation finished",
                id = id.as_str(),
                scanned = report.scanned,
                moved = report.moved,
                failed = report.failed
            );
        }
        Ok(report)
    }

    async fn relocate(&self, source: &Member, report: &mut RelocationReport) {
        let mut misplaced = Vec::new();
        {
            let mut keys = source.scan_once();
            while let Some(item) = keys.next().await {
                match item {
                    Ok(key) => {
                        report.scanned += 1;
                        match self.owner(&key) {
                            Some(owner) if owner.id() != source.id() => misplaced.push((key, owner)),
                            _ => {}
                        }
                    }
                    Err(e) => {
                        log_ring_warn!(
                            "Relocation scan failed",
                            id = source.id(),
                            error = display(&e)
                        );
                        report.failed += 1;
                        break;
                    }
                }
            }
        }

        let results: Vec<_> = stream::iter(misplaced)
            .map(|(key, dest)| async move {
                let result = self.migrate(source, &dest, &key).await;
                (key, dest, result)
            })
            .buffer_unordered(self.options.relocation_concurrency.max(1))
            .collect()
            .await;

        for (key, dest, result) in results {
            match result {
                Ok(()) => {
                    report.moved += 1;
                    log_ring_debug!(
                        "Moved block",
                        key = key.as_str(),
                        from = source.id(),
                        to = dest.id()
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    log_ring_warn!(
                        "Error moving block",
                        key = key.as_str(),
                        from = source.id(),
                        to = dest.id(),
                        error = display(&e)
                    );
                }
            }
        }
    }

    /// Copy then delete. The aggregate follows each step that lands, so it
    /// stays equal to the members' sum even when the destination already
    /// held the key or the delete fails.
    async fn migrate(&self, from: &Member, to: &Member, key: &str) -> Result<()> {
        let block = from.get(key).await?;
        let delta = to.store(key, &block).await?;
        self.ledger.apply(&self.uid, delta);
        if let Err(e) = from.remove(key).await {
            log_ring_error!(
                "Block copied but left on source",
                key = key,
                from = from.id(),
                to = to.id(),
                error = display(&e)
            );
            return Err(e);
        }
        self.ledger.refund(&self.uid, block.len() as u64);
        Ok(())
    }

    fn owner(&self, key: &str) -> Option<Member> {
        let hash = placement_hash(key);
        select(&self.read_members(), &hash).map(|(_, m)| Arc::clone(m))
    }

    fn route(&self, key: &str) -> Result<Member> {
        validate_key(key)?;
        self.owner(key).ok_or(StoreError::EmptyRing)
    }

    fn read_members(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Member>> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BlockSource for UnifiedBlockStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.route(key)?.get(key).await
    }

    #[instrument(skip(self, block), fields(len = block.len()), level = "debug")]
    async fn store(&self, key: &str, block: &[u8]) -> Result<i64> {
        let member = self.route(key)?;
        if block.len() > MAX_BLOCK_SIZE {
            return Err(StoreError::OversizedBlock {
                len: block.len(),
                max: MAX_BLOCK_SIZE,
            });
        }

        let requested = block.len() as u64;
        let used = self.quota();
        let capacity = self.size();
        if used.saturating_add(requested) > capacity {
            return Err(StoreError::StoreFull {
                uid: self.uid.clone(),
                used,
                requested,
                capacity,
            });
        }

        // Held until the member answers, so concurrent writers see it
        let hold = self.ledger.hold(&self.uid, requested as i64);
        let delta = member.store(key, block).await?;
        hold.settle(delta);
        Ok(delta)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let member = self.route(key)?;
        let block = member.get(key).await?;
        member.remove(key).await?;
        self.ledger.refund(&self.uid, block.len() as u64);
        Ok(())
    }
}
