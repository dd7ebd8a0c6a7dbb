//! VM lifecycle and execution subsystem for isolating untrusted agent
//! workloads inside KVM-backed virtual machines.
//!
//! A pool ([`pool::VMPool`]) amortizes VM boot cost by keeping warm
//! instances snapped to a golden state; [`executor::AgentExecutor`] stages
//! code onto a [`fs_share::FilesystemShare`], dispatches it over
//! [`vsock::VsockProtocol`], and enforces a wall-clock deadline.
//! [`safety::SafetyValidator`] gates inputs before they reach the executor;
//! [`serializer::SecureSerializer`] and [`tar_extractor::SecureTarExtractor`]
//! guard anything persisted or extracted across a trust boundary.

pub mod clock;
pub mod connection;
pub mod error;
pub mod executor;
pub mod fs_share;
pub mod pool;
pub mod safety;
pub mod serializer;
pub mod snapshot;
pub mod template;
pub mod tar_extractor;
pub mod vm;
pub mod vsock;

pub use clock::{Clock, SystemClock};
pub use connection::{Connection, ConnectionGuard};
pub use error::{
    ConnectionError, ExecutionError, FilesystemError, SecurityError, SerializationError,
    SnapshotError, VMError, VMPoolError, VsockError,
};
pub use executor::{AgentExecutor, ExecutionResult, ExecutorConfig};
pub use fs_share::FilesystemShare;
pub use pool::{PoolConfig, PooledVM, VMPool};
pub use safety::{Content, Operation, RiskLevel, SafetyPolicy, SafetyValidator, ValidationOutcome};
pub use serializer::{SecureSerializer, Tagged};
pub use snapshot::{Snapshot, SnapshotManager};
pub use tar_extractor::{validate_file_path, ExtractMode, SecureTarExtractor};
pub use template::{NetworkMode, ResourceProfile, Template};
pub use vm::{VMState, VM};
pub use vsock::{VsockMessage, VsockProtocol, DEFAULT_PORT};
