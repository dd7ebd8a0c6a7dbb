//! Per-component error taxonomy.
//!
//! Each component owns its own error enum rather than sharing one big
//! catch-all, mirroring how the rest of this codebase scopes errors to the
//! repository/service that raises them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {uri}: {source}")]
    OpenFailed { uri: String, source: virt::error::Error },
    #[error("libvirt.open returned no connection for {uri}")]
    NoConnection { uri: String },
    #[error("not connected to libvirt")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum VMError {
    #[error("start failed: {0}")]
    StartFailed(String),
    #[error("stop failed: {0}")]
    StopFailed(String),
    #[error("failed to get VM state: {0}")]
    StateFailed(String),
    #[error(
        "timeout waiting for state {desired} (current: {current}, timeout: {timeout_secs}s)"
    )]
    Timeout {
        desired: String,
        current: String,
        timeout_secs: f64,
    },
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to create snapshot '{name}': {source}")]
    CreateFailed { name: String, source: virt::error::Error },
    #[error("cannot restore snapshot '{name}': no backend handle")]
    MissingHandleOnRestore { name: String },
    #[error("failed to restore snapshot '{name}': {source}")]
    RestoreFailed { name: String, source: virt::error::Error },
    #[error("failed to delete snapshot '{name}': {source}")]
    DeleteFailed { name: String, source: virt::error::Error },
}

#[derive(Debug, Error)]
pub enum FilesystemError {
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("failed to mount share at {path}: {reason}")]
    MountFailed { path: String, reason: String },
    #[error("failed to unmount share at {path}: {reason}")]
    UnmountFailed { path: String, reason: String },
    #[error("failed to write file {path}: {reason}")]
    WriteFailed { path: String, reason: String },
    #[error("failed to read file {path}: {reason}")]
    ReadFailed { path: String, reason: String },
    #[error("path {path} resolves outside share root")]
    PathEscapesRoot { path: String },
}

#[derive(Debug, Error)]
pub enum VsockError {
    #[error("CID must be positive, got: {0}")]
    InvalidCid(u32),
    #[error("port must be between 1 and 65535, got: {0}")]
    InvalidPort(u32),
    #[error("socket not initialized")]
    SocketNotInitialized,
    #[error("unexpected end of stream reading {0}")]
    UnexpectedEof(&'static str),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
    #[error("invalid UTF-8 in frame: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum VMPoolError {
    #[error("pool exhausted: no VM became available within the configured wait")]
    Exhausted,
    #[error("failed to provision VM: {0}")]
    ProvisioningFailed(String),
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("workspace does not exist: {0}")]
    WorkspaceMissing(String),
    #[error("agent code cannot be empty")]
    EmptyCode,
    #[error("timeout must be positive")]
    NonPositiveTimeout,
    #[error("timeout {timeout_secs}s exceeds maximum {max_secs}s")]
    TimeoutExceedsMax { timeout_secs: u64, max_secs: u64 },
    #[error("default timeout cannot exceed max timeout")]
    DefaultExceedsMax,
    #[error("execution timed out after {0} seconds")]
    TimedOut(u64),
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),
}

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("blocked path traversal attempt: {0}")]
    PathTraversal(String),
    #[error("blocked absolute path: {0}")]
    AbsolutePath(String),
    #[error("blocked device file: {0}")]
    DeviceFile(String),
    #[error("blocked symbolic/hard link: {0}")]
    Link(String),
    #[error("archive too large: {total} bytes exceeds limit of {limit} bytes")]
    ArchiveTooLarge { total: u64, limit: u64 },
    #[error("member too large: {name} ({size} bytes) exceeds limit of {limit} bytes")]
    MemberTooLarge { name: String, size: u64, limit: u64 },
    #[error("invalid tar archive: {0}")]
    InvalidArchive(String),
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("signature verification failed - data may be tampered")]
    SignatureMismatch,
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}
