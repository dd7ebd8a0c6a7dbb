//! Session handle to the virtualization backend.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};
use virt::connect::Connect;

use crate::error::ConnectionError;

/// Opaque session to the hypervisor. `qemu:///system` style URI.
///
/// Every libvirt call is blocking FFI; it runs on `spawn_blocking` so an
/// async caller never stalls the runtime. The handle is held behind an
/// `Arc<Mutex<_>>` purely so it can cross the `spawn_blocking` boundary by
/// cheap clone rather than by value.
pub struct Connection {
    uri: String,
    handle: Arc<Mutex<Option<Connect>>>,
}

impl Connection {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Opens the session. Idempotent: a no-op if already connected.
    pub async fn open(&mut self) -> Result<(), ConnectionError> {
        if self.handle.lock().expect("connection mutex poisoned").is_some() {
            return Ok(());
        }
        let uri = self.uri.clone();
        let conn = tokio::task::spawn_blocking(move || Connect::open(Some(&uri)))
            .await
            .expect("blocking libvirt open task panicked")
            .map_err(|source| ConnectionError::OpenFailed {
                uri: self.uri.clone(),
                source,
            })?;
        info!(uri = %self.uri, "opened libvirt connection");
        *self.handle.lock().expect("connection mutex poisoned") = Some(conn);
        Ok(())
    }

    /// Closes the session. Idempotent, never propagates an error: any
    /// failure is logged and the internal handle is reset regardless, so
    /// resource reclamation is guaranteed.
    pub async fn close(&mut self) {
        let taken = self.handle.lock().expect("connection mutex poisoned").take();
        let Some(mut conn) = taken else {
            return;
        };
        let result = tokio::task::spawn_blocking(move || conn.close()).await;
        match result {
            Ok(Ok(_)) => info!(uri = %self.uri, "closed libvirt connection"),
            Ok(Err(e)) => warn!(uri = %self.uri, error = %e, "error closing libvirt connection"),
            Err(e) => warn!(uri = %self.uri, error = %e, "close task panicked"),
        }
    }

    /// Alive probe. Never throws through: returns `false` on any error,
    /// including an absent handle.
    pub async fn is_connected(&self) -> bool {
        let handle = self.handle.clone();
        tokio::task::spawn_blocking(move || {
            match handle.lock().expect("connection mutex poisoned").as_ref() {
                Some(conn) => conn.is_alive().unwrap_or(false),
                None => false,
            }
        })
        .await
        .unwrap_or(false)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Clone of the shared backend handle, for components (e.g. `VM`,
    /// `SnapshotManager`) that need to issue further blocking libvirt calls
    /// against this session.
    pub(crate) fn handle_arc(&self) -> Arc<Mutex<Option<Connect>>> {
        self.handle.clone()
    }

    /// Opens a session and returns a guard that closes it on drop, so the
    /// session is released on every exit path out of the caller's scope —
    /// an early return via `?`, a panic, or normal completion.
    pub async fn scoped(uri: impl Into<String>) -> Result<ConnectionGuard, ConnectionError> {
        let mut connection = Connection::new(uri);
        connection.open().await?;
        Ok(ConnectionGuard { connection })
    }
}

/// RAII wrapper around an open [`Connection`]. Closing is a blocking
/// libvirt FFI call; `Drop` runs it directly rather than through
/// `spawn_blocking`, the same tradeoff the rest of the standard library
/// accepts for synchronous cleanup in a destructor.
pub struct ConnectionGuard {
    connection: Connection,
}

impl std::ops::Deref for ConnectionGuard {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let taken = self
            .connection
            .handle
            .lock()
            .expect("connection mutex poisoned")
            .take();
        let Some(mut conn) = taken else {
            return;
        };
        match conn.close() {
            Ok(_) => info!(uri = %self.connection.uri, "closed libvirt connection (guard drop)"),
            Err(e) => warn!(uri = %self.connection.uri, error = %e, "error closing libvirt connection during guard drop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn is_connected_false_without_open() {
        let conn = Connection::new("qemu:///system");
        assert!(!conn.is_connected().await);
    }
}
