//! Domain wrapper: lifecycle, state query, await-state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::connection::Connection;
use crate::error::VMError;
use crate::template::Template;

/// Observable VM state, derived solely from the backend on every query.
/// The wrapper caches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VMState {
    Running,
    Paused,
    Shutdown,
    ShutOff,
    Crashed,
    Unknown,
}

impl VMState {
    fn from_backend_code(code: u32) -> Self {
        match code {
            sys::VIR_DOMAIN_RUNNING | sys::VIR_DOMAIN_BLOCKED => VMState::Running,
            sys::VIR_DOMAIN_PAUSED | sys::VIR_DOMAIN_PMSUSPENDED => VMState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => VMState::Shutdown,
            sys::VIR_DOMAIN_SHUTOFF => VMState::ShutOff,
            sys::VIR_DOMAIN_CRASHED => VMState::Crashed,
            _ => VMState::Unknown,
        }
    }
}

impl std::fmt::Display for VMState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VMState::Running => "Running",
            VMState::Paused => "Paused",
            VMState::Shutdown => "Shutdown",
            VMState::ShutOff => "ShutOff",
            VMState::Crashed => "Crashed",
            VMState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A defined domain. Identity is `{name, uuid}`; the only owned mutable
/// state is the backend handle itself.
///
/// Construction never fails even if the domain can't answer `name()`/
/// `uuid()` yet — those accessors are evaluated lazily on first use, not
/// validated at construction, mirroring the original's late-bound logger.
pub struct VM {
    domain: Arc<Mutex<Domain>>,
}

impl VM {
    /// Defines a new domain from `template` against `connection`.
    pub async fn define(connection: &Connection, template: &Template) -> Result<Self, VMError> {
        let xml = template.generate();
        let conn_handle = connection.handle_arc();
        let domain = tokio::task::spawn_blocking(move || -> Result<Domain, String> {
            let guard = conn_handle.lock().expect("connection mutex poisoned");
            let conn: &Connect = guard.as_ref().ok_or("not connected")?;
            Domain::define_xml(conn, &xml).map_err(|e| e.to_string())
        })
        .await
        .expect("blocking define task panicked")
        .map_err(VMError::StartFailed)?;

        Ok(Self {
            domain: Arc::new(Mutex::new(domain)),
        })
    }

    fn handle(&self) -> Arc<Mutex<Domain>> {
        self.domain.clone()
    }

    /// Shared backend handle, for `SnapshotManager` and other components
    /// that need to issue further blocking libvirt calls against this
    /// domain.
    pub(crate) fn domain_handle(&self) -> Arc<Mutex<Domain>> {
        self.domain.clone()
    }

    pub async fn name(&self) -> Result<String, VMError> {
        let domain = self.handle();
        tokio::task::spawn_blocking(move || {
            domain
                .lock()
                .expect("domain mutex poisoned")
                .get_name()
                .map_err(|e| VMError::StateFailed(e.to_string()))
        })
        .await
        .expect("blocking name task panicked")
    }

    /// Parses the backend's uuid string into a typed `Uuid` rather than
    /// passing it around as an unstructured `String`.
    pub async fn uuid(&self) -> Result<Uuid, VMError> {
        let domain = self.handle();
        let raw = tokio::task::spawn_blocking(move || {
            domain
                .lock()
                .expect("domain mutex poisoned")
                .get_uuid_string()
                .map_err(|e| VMError::StateFailed(e.to_string()))
        })
        .await
        .expect("blocking uuid task panicked")?;
        Uuid::parse_str(&raw).map_err(|e| VMError::StateFailed(e.to_string()))
    }

    /// Current state, mapped from the backend's raw code. No-op, cached
    /// nowhere.
    pub async fn state(&self) -> Result<VMState, VMError> {
        let domain = self.handle();
        let code = tokio::task::spawn_blocking(move || {
            domain
                .lock()
                .expect("domain mutex poisoned")
                .get_state()
                .map(|(state, _reason)| state)
                .map_err(|e| VMError::StateFailed(e.to_string()))
        })
        .await
        .expect("blocking state task panicked")?;
        Ok(VMState::from_backend_code(code))
    }

    /// No-op if already active; otherwise boots the domain.
    pub async fn start(&self) -> Result<(), VMError> {
        if matches!(self.state().await?, VMState::Running) {
            return Ok(());
        }
        let domain = self.handle();
        tokio::task::spawn_blocking(move || {
            domain
                .lock()
                .expect("domain mutex poisoned")
                .create()
                .map_err(|e| VMError::StartFailed(e.to_string()))
        })
        .await
        .expect("blocking start task panicked")?;
        info!("vm started");
        Ok(())
    }

    /// No-op if already inactive. `graceful=true` requests ACPI shutdown
    /// (asynchronous — caller must `await_state`); `graceful=false` forcibly
    /// destroys the domain.
    pub async fn stop(&self, graceful: bool) -> Result<(), VMError> {
        if matches!(
            self.state().await?,
            VMState::Shutdown | VMState::ShutOff | VMState::Crashed
        ) {
            return Ok(());
        }
        let domain = self.handle();
        tokio::task::spawn_blocking(move || {
            let domain = domain.lock().expect("domain mutex poisoned");
            if graceful {
                domain.shutdown()
            } else {
                domain.destroy()
            }
            .map_err(|e| VMError::StopFailed(e.to_string()))
        })
        .await
        .expect("blocking stop task panicked")?;
        info!(graceful, "vm stop requested");
        Ok(())
    }

    /// Cooperatively polls `state()` at `poll_interval` spacing until it
    /// equals `target`, or fails with `VMError::Timeout` once elapsed time
    /// exceeds `timeout`.
    pub async fn await_state(
        &self,
        target: VMState,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), VMError> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.state().await?;
            if current == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(%target, %current, "timed out waiting for vm state");
                return Err(VMError::Timeout {
                    desired: target.to_string(),
                    current: current.to_string(),
                    timeout_secs: timeout.as_secs_f64(),
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// `await_state` with the default 0.5s poll interval and 30s timeout.
    pub async fn await_state_default(&self, target: VMState) -> Result<(), VMError> {
        self.await_state(target, Duration::from_secs(30), Duration::from_millis(500))
            .await
    }

    /// Destroys the domain (force-stop) and undefines it.
    pub async fn destroy(&self) -> Result<(), VMError> {
        self.stop(false).await?;
        let domain = self.handle();
        tokio::task::spawn_blocking(move || {
            domain
                .lock()
                .expect("domain mutex poisoned")
                .undefine()
                .map_err(|e| VMError::StopFailed(e.to_string()))
        })
        .await
        .expect("blocking undefine task panicked")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping_matches_original_table() {
        assert_eq!(
            VMState::from_backend_code(sys::VIR_DOMAIN_RUNNING),
            VMState::Running
        );
        assert_eq!(
            VMState::from_backend_code(sys::VIR_DOMAIN_BLOCKED),
            VMState::Running
        );
        assert_eq!(
            VMState::from_backend_code(sys::VIR_DOMAIN_PAUSED),
            VMState::Paused
        );
        assert_eq!(
            VMState::from_backend_code(sys::VIR_DOMAIN_PMSUSPENDED),
            VMState::Paused
        );
        assert_eq!(
            VMState::from_backend_code(sys::VIR_DOMAIN_SHUTDOWN),
            VMState::Shutdown
        );
        assert_eq!(
            VMState::from_backend_code(sys::VIR_DOMAIN_SHUTOFF),
            VMState::ShutOff
        );
        assert_eq!(
            VMState::from_backend_code(sys::VIR_DOMAIN_CRASHED),
            VMState::Crashed
        );
        assert_eq!(
            VMState::from_backend_code(sys::VIR_DOMAIN_NOSTATE),
            VMState::Unknown
        );
        assert_eq!(VMState::from_backend_code(9999), VMState::Unknown);
    }
}
