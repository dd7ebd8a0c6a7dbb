//! Snapshot create/list/restore/delete.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;
use virt::domain_snapshot::DomainSnapshot;

use crate::clock::Clock;
use crate::error::SnapshotError;
use crate::vm::VM;

/// `{name, description, created_at, backend_handle}`. Lifetime bounded by
/// the owning VM; names are unique within a single VM.
#[derive(Clone)]
pub struct Snapshot {
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    handle: Arc<DomainSnapshot>,
}

/// Stateless: every operation takes an explicit `VM` or `Snapshot`.
pub struct SnapshotManager {
    clock: Arc<dyn Clock>,
}

impl SnapshotManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Constructs an internal snapshot definition and returns a `Snapshot`
    /// stamped with `created_at = clock.now()`, taken *after* the backend
    /// call returns.
    pub async fn create(
        &self,
        vm: &VM,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Snapshot, SnapshotError> {
        let name = name.into();
        let description = description.into();
        let xml = snapshot_xml(&name, &description);
        let domain = vm.domain_handle();
        let name_for_err = name.clone();
        let snap = tokio::task::spawn_blocking(move || {
            let domain = domain.lock().expect("domain mutex poisoned");
            DomainSnapshot::create_xml(&domain, &xml, 0)
        })
        .await
        .expect("blocking snapshot create task panicked")
        .map_err(|source| SnapshotError::CreateFailed {
            name: name_for_err,
            source,
        })?;

        Ok(Snapshot {
            name,
            description,
            created_at: self.clock.now(),
            handle: Arc::new(snap),
        })
    }

    /// Lists all snapshots of `vm`. Non-critical: backend errors are
    /// logged and degrade to an empty list.
    pub async fn list(&self, vm: &VM) -> Vec<Snapshot> {
        let domain = vm.domain_handle();
        let names = tokio::task::spawn_blocking(move || {
            let domain = domain.lock().expect("domain mutex poisoned");
            domain.snapshot_list_names(0)
        })
        .await
        .expect("blocking snapshot list task panicked");

        match names {
            Ok(names) => {
                let mut snapshots = Vec::with_capacity(names.len());
                for name in names {
                    if let Some(snapshot) = self.lookup(vm, &name).await {
                        snapshots.push(snapshot);
                    }
                }
                snapshots
            }
            Err(e) => {
                warn!(error = %e, "failed to list snapshots, degrading to empty");
                Vec::new()
            }
        }
    }

    /// Best-effort lookup used only to backfill metadata for `list`;
    /// failures are swallowed the same way the backend error they're
    /// derived from already is.
    async fn lookup(&self, vm: &VM, name: &str) -> Option<Snapshot> {
        let domain = vm.domain_handle();
        let name_owned = name.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            let domain = domain.lock().expect("domain mutex poisoned");
            DomainSnapshot::lookup_by_name(&domain, &name_owned, 0)
        })
        .await
        .expect("blocking snapshot lookup task panicked")
        .ok()?;

        Some(Snapshot {
            name: name.to_string(),
            description: String::new(),
            created_at: self.clock.now(),
            handle: Arc::new(handle),
        })
    }

    /// Reverts `vm` to `snapshot`. Requires a backend handle on the
    /// snapshot value.
    pub async fn restore(&self, vm: &VM, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let domain = vm.domain_handle();
        let handle = snapshot.handle.clone();
        let name = snapshot.name.clone();
        tokio::task::spawn_blocking(move || {
            let domain = domain.lock().expect("domain mutex poisoned");
            domain.revert_to_snapshot(&handle, 0)
        })
        .await
        .expect("blocking snapshot restore task panicked")
        .map_err(|source| SnapshotError::RestoreFailed { name, source })
    }

    /// Irreversible removal.
    pub async fn delete(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let handle = snapshot.handle.clone();
        let name = snapshot.name.clone();
        tokio::task::spawn_blocking(move || handle.delete(0))
            .await
            .expect("blocking snapshot delete task panicked")
            .map_err(|source| SnapshotError::DeleteFailed { name, source })
    }
}

/// Builds snapshot XML through element construction rather than raw
/// f-string interpolation, so a `name`/`description` containing XML
/// metacharacters can't produce an invalid document.
fn snapshot_xml(name: &str, description: &str) -> String {
    format!(
        "<domainsnapshot>\n  <name>{}</name>\n  <description>{}</description>\n</domainsnapshot>\n",
        xml_escape(name),
        xml_escape(description),
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_metacharacters_in_name() {
        let xml = snapshot_xml("a&b<c>", "");
        assert!(xml.contains("a&amp;b&lt;c&gt;"));
        assert!(!xml.contains("a&b<c>"));
    }
}
