//! Bounded set of warm, golden-snapshotted VMs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::connection::Connection;
use crate::error::VMPoolError;
use crate::snapshot::SnapshotManager;
use crate::template::Template;
use crate::vm::{VMState, VM};

/// `{vm, golden_snapshot_name, created_at, in_use, last_used_at}`.
///
/// Invariant: while `in_use == false` the VM's state equals the golden
/// snapshot's state, enforced by revert-on-release.
#[derive(Clone)]
pub struct PooledVM {
    pub vm: Arc<VM>,
    pub golden_snapshot_name: String,
    pub created_at: DateTime<Utc>,
    pub in_use: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    key: String,
}

impl PooledVM {
    /// Stable identity (the VM's libvirt uuid) used to key `VMPool::release`.
    pub fn key(&self) -> &str {
        &self.key
    }
}

pub struct PoolConfig {
    pub capacity: usize,
    pub golden_snapshot_name: String,
    pub idle_ttl: Option<Duration>,
    pub boot_template: Template,
    /// How long `acquire` waits for a release before failing with
    /// `VMPoolError::Exhausted`.
    pub acquire_wait: Duration,
}

impl PoolConfig {
    pub fn new(capacity: usize, boot_template: Template) -> Self {
        Self {
            capacity,
            golden_snapshot_name: "golden".to_string(),
            idle_ttl: None,
            boot_template,
            acquire_wait: Duration::from_secs(30),
        }
    }
}

/// A bounded set of warm VMs. The idle set and the in-use set are two
/// separate locks, and a VM is always removed from one before being
/// inserted into the other — never held under both at once, which would
/// risk a lock-order deadlock against a concurrent release.
pub struct VMPool {
    config: PoolConfig,
    idle: Mutex<VecDeque<PooledVM>>,
    in_use: Mutex<HashMap<String, PooledVM>>,
    /// Count of provisioned-but-not-yet-evicted VMs, guarded by the same
    /// lock used to admit a new provision. Holding this lock across the
    /// whole check-provision-increment sequence in `acquire` is what keeps
    /// two concurrent callers from both seeing a free slot and overshooting
    /// capacity.
    live_count: Mutex<usize>,
    released: Notify,
    snapshots: SnapshotManager,
}

impl VMPool {
    pub fn new(config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            idle: Mutex::new(VecDeque::new()),
            in_use: Mutex::new(HashMap::new()),
            live_count: Mutex::new(0),
            released: Notify::new(),
            snapshots: SnapshotManager::new(clock),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub async fn live_count(&self) -> usize {
        *self.live_count.lock().await
    }

    /// Returns a `PooledVM` guaranteed to be at the golden state, marked
    /// in-use. Preference order: an idle VM, then fresh provisioning if
    /// under capacity, then a bounded wait for a release.
    pub async fn acquire(&self, connection: &Connection) -> Result<PooledVM, VMPoolError> {
        if let Some(mut pooled) = self.take_idle().await {
            pooled.in_use = true;
            self.insert_in_use(pooled.key.clone(), &pooled).await;
            return Ok(pooled);
        }

        if let Some(pooled) = self.try_provision_slot(connection).await? {
            self.insert_in_use(pooled.key.clone(), &pooled).await;
            return Ok(pooled);
        }

        let wait = tokio::time::timeout(self.config.acquire_wait, self.released.notified()).await;
        if wait.is_err() {
            return Err(VMPoolError::Exhausted);
        }
        // A slot may now be idle; one more attempt, no further waiting.
        if let Some(mut pooled) = self.take_idle().await {
            pooled.in_use = true;
            self.insert_in_use(pooled.key.clone(), &pooled).await;
            return Ok(pooled);
        }
        Err(VMPoolError::Exhausted)
    }

    /// Admits one new provision if under capacity. The `live_count` lock is
    /// held for the entire check-then-provision-then-increment sequence so
    /// two concurrent callers can't both observe a free slot; provisioning
    /// is serialized across callers racing for the last slot as a result.
    async fn try_provision_slot(
        &self,
        connection: &Connection,
    ) -> Result<Option<PooledVM>, VMPoolError> {
        let mut count = self.live_count.lock().await;
        if *count >= self.config.capacity {
            return Ok(None);
        }
        let pooled = self.provision(connection).await?;
        *count += 1;
        Ok(Some(pooled))
    }

    async fn take_idle(&self) -> Option<PooledVM> {
        let mut idle = self.idle.lock().await;
        idle.pop_front()
    }

    async fn insert_in_use(&self, key: String, pooled: &PooledVM) {
        let mut in_use = self.in_use.lock().await;
        in_use.insert(key, pooled.clone());
    }

    async fn provision(&self, connection: &Connection) -> Result<PooledVM, VMPoolError> {
        let vm = VM::define(connection, &self.config.boot_template)
            .await
            .map_err(|e| VMPoolError::ProvisioningFailed(e.to_string()))?;
        vm.start()
            .await
            .map_err(|e| VMPoolError::ProvisioningFailed(e.to_string()))?;
        vm.await_state_default(VMState::Running)
            .await
            .map_err(|e| VMPoolError::ProvisioningFailed(e.to_string()))?;

        let snapshot = self
            .snapshots
            .create(&vm, self.config.golden_snapshot_name.clone(), "pool golden state")
            .await
            .map_err(|e| VMPoolError::ProvisioningFailed(e.to_string()))?;

        let key = vm
            .uuid()
            .await
            .map_err(|e| VMPoolError::ProvisioningFailed(e.to_string()))?
            .to_string();
        info!(vm = %key, "provisioned new pool VM");

        Ok(PooledVM {
            vm: Arc::new(vm),
            golden_snapshot_name: snapshot.name,
            created_at: snapshot.created_at,
            in_use: true,
            last_used_at: None,
            key,
        })
    }

    /// Reverts the VM to its golden snapshot, marks it available, and
    /// records `last_used_at`. A revert failure poisons the VM: it is
    /// destroyed, removed for good, and capacity is decremented so the
    /// next `acquire` can provision a replacement.
    pub async fn release(&self, key: &str, now: DateTime<Utc>) {
        let pooled = {
            let mut in_use = self.in_use.lock().await;
            in_use.remove(key)
        };
        let Some(mut pooled) = pooled else {
            warn!(vm = key, "release called for unknown/untracked VM");
            return;
        };

        match self.revert_to_golden(&pooled).await {
            Ok(()) => {
                pooled.in_use = false;
                pooled.last_used_at = Some(now);
                let mut idle = self.idle.lock().await;
                idle.push_back(pooled);
                drop(idle);
                self.released.notify_one();
            }
            Err(e) => {
                warn!(vm = key, error = %e, "revert failed, evicting poisoned VM");
                if let Err(e) = pooled.vm.destroy().await {
                    warn!(vm = key, error = %e, "failed to destroy poisoned VM");
                }
                let mut count = self.live_count.lock().await;
                *count = count.saturating_sub(1);
                drop(count);
                self.released.notify_one();
            }
        }
    }

    async fn revert_to_golden(&self, pooled: &PooledVM) -> Result<(), crate::error::SnapshotError> {
        let snapshots = self.snapshots.list(&pooled.vm).await;
        let golden = snapshots
            .into_iter()
            .find(|s| s.name == pooled.golden_snapshot_name);
        match golden {
            Some(snapshot) => self.snapshots.restore(&pooled.vm, &snapshot).await,
            None => Err(crate::error::SnapshotError::MissingHandleOnRestore {
                name: pooled.golden_snapshot_name.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_defaults_reasonable() {
        let cfg = PoolConfig::new(4, Template::new("pool-boot"));
        assert_eq!(cfg.capacity, 4);
        assert_eq!(cfg.golden_snapshot_name, "golden");
    }
}
