//! Identifier allocation.
//!
//! The hypervisor's live instance list is the authority on which identifiers
//! are in use. The allocator picks the lowest identifier that is neither live,
//! reserved by this process, nor excluded by the caller. The reservation set is
//! only a hint: two processes can still pick the same identifier, and the
//! loser finds out when its clone fails with `CloneConflict` and allocates again
//! with that identifier excluded.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use trialhost_common::{InstanceId, PoolConfig, ProvisionError};

use crate::lifecycle::Hypervisor;

/// Source of instance identifiers.
#[async_trait]
pub trait IdentifierPool: Send + Sync {
    /// Reserve the lowest free identifier not in `excluded`.
    ///
    /// # Errors
    ///
    /// [`ProvisionError::PoolExhausted`] if no identifier is free.
    async fn allocate(&self, excluded: &BTreeSet<InstanceId>)
    -> Result<InstanceId, ProvisionError>;

    /// An instance now exists under `id`; the reservation is no longer needed.
    fn confirm(&self, id: InstanceId);

    /// Give back a reservation. A no-op for identifiers that were confirmed.
    fn release(&self, id: InstanceId);
}

/// Lowest identifier in `pool` for which `in_use` is false.
pub fn lowest_free(pool: PoolConfig, in_use: impl Fn(InstanceId) -> bool) -> Option<InstanceId> {
    pool.range().map(InstanceId::new).find(|id| !in_use(*id))
}

/// [`IdentifierPool`] backed by the hypervisor's live instance list.
pub struct PoolAllocator {
    pool: PoolConfig,
    hypervisor: Arc<dyn Hypervisor>,
    reserved: Mutex<BTreeSet<InstanceId>>,
}

impl PoolAllocator {
    pub fn new(pool: PoolConfig, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            pool,
            hypervisor,
            reserved: Mutex::new(BTreeSet::new()),
        }
    }

    /// Identifiers currently reserved but not yet confirmed.
    pub fn reserved(&self) -> BTreeSet<InstanceId> {
        self.reserved.lock().clone()
    }
}

#[async_trait]
impl IdentifierPool for PoolAllocator {
    #[instrument(skip(self, excluded), fields(excluded = excluded.len()))]
    async fn allocate(
        &self,
        excluded: &BTreeSet<InstanceId>,
    ) -> Result<InstanceId, ProvisionError> {
        let live = self.hypervisor.list_instance_ids().await?;

        let mut reserved = self.reserved.lock();
        let id = lowest_free(self.pool, |id| {
            live.contains(&id) || reserved.contains(&id) || excluded.contains(&id)
        })
        .ok_or(ProvisionError::PoolExhausted {
            start: self.pool.start,
            end: self.pool.end,
        })?;
        reserved.insert(id);

        debug!(vmid = %id, live = live.len(), "Identifier reserved");
        Ok(id)
    }

    fn confirm(&self, id: InstanceId) {
        self.reserved.lock().remove(&id);
    }

    fn release(&self, id: InstanceId) {
        if self.reserved.lock().remove(&id) {
            debug!(vmid = %id, "Identifier released");
        }
    }
}

impl std::fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("pool", &self.pool)
            .field("reserved", &self.reserved.lock().len())
            .finish_non_exhaustive()
    }
}
