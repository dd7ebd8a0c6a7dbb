//! End-to-end: stage code, dispatch over vsock, await a deadline, harvest
//! results, release resources unconditionally.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::error::ExecutionError;
use crate::fs_share::FilesystemShare;
use crate::vsock::{VsockMessage, VsockProtocol};

/// `0 < default_timeout <= max_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

impl ExecutorConfig {
    pub fn new(default_timeout: Duration, max_timeout: Duration) -> Result<Self, ExecutionError> {
        if default_timeout.is_zero() {
            return Err(ExecutionError::NonPositiveTimeout);
        }
        if default_timeout > max_timeout {
            return Err(ExecutionError::DefaultExceedsMax);
        }
        Ok(Self {
            default_timeout,
            max_timeout,
        })
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            max_timeout: Duration::from_secs(3600),
        }
    }
}

/// `{success, exit_code, stdout, stderr, duration_seconds, output}`.
/// `success ⇔ exit_code == 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
    pub output: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GuestResultPayload {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

pub struct AgentExecutor {
    config: ExecutorConfig,
}

impl AgentExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Stages `code` into the guest share, dispatches an `execute` message,
    /// awaits the guest's `result` message under a wall-clock deadline, and
    /// harvests `output/results.json`. The share is unmounted on every exit
    /// path.
    pub async fn execute<S>(
        &self,
        vsock: &mut VsockProtocol<S>,
        share: &mut FilesystemShare,
        code: &[u8],
        workspace: &Path,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, ExecutionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let timeout = self.resolve_timeout(timeout)?;
        self.validate(code, workspace).await?;

        share
            .acquire()
            .await
            .map_err(|e| ExecutionError::DispatchFailed(e.to_string()))?;

        let result = self.run(vsock, share, code, timeout).await;

        share.release().await;
        result
    }

    async fn validate(&self, code: &[u8], workspace: &Path) -> Result<(), ExecutionError> {
        if tokio::fs::metadata(workspace).await.is_err() {
            return Err(ExecutionError::WorkspaceMissing(
                workspace.display().to_string(),
            ));
        }
        if code.is_empty() {
            return Err(ExecutionError::EmptyCode);
        }
        Ok(())
    }

    fn resolve_timeout(&self, timeout: Option<Duration>) -> Result<Duration, ExecutionError> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        if timeout.is_zero() {
            return Err(ExecutionError::NonPositiveTimeout);
        }
        if timeout > self.config.max_timeout {
            return Err(ExecutionError::TimeoutExceedsMax {
                timeout_secs: timeout.as_secs(),
                max_secs: self.config.max_timeout.as_secs(),
            });
        }
        Ok(timeout)
    }

    async fn run<S>(
        &self,
        vsock: &mut VsockProtocol<S>,
        share: &mut FilesystemShare,
        code: &[u8],
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        share
            .write_file("input/agent.py", code)
            .await
            .map_err(|e| ExecutionError::DispatchFailed(e.to_string()))?;

        let script_path = format!("{}/input/agent.py", share.guest_mount_point());
        let dispatch = VsockMessage::new("execute", script_path.into_bytes());
        vsock
            .send(&dispatch)
            .await
            .map_err(|e| ExecutionError::DispatchFailed(e.to_string()))?;

        let started = tokio::time::Instant::now();
        let response = tokio::time::timeout(timeout, vsock.receive()).await;

        let message = match response {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => return Err(ExecutionError::DispatchFailed(e.to_string())),
            Err(_) => {
                // Best-effort cancellation of the in-flight request; failure
                // here is not itself an error worth surfacing.
                let cancel = VsockMessage::new("cancel", Vec::new());
                if let Err(e) = vsock.send(&cancel).await {
                    warn!(error = %e, "failed to send best-effort cancel after timeout");
                }
                return Err(ExecutionError::TimedOut(timeout.as_secs()));
            }
        };
        let duration_seconds = started.elapsed().as_secs_f64();

        let guest_result: GuestResultPayload = serde_json::from_slice(message.payload())
            .map_err(|e| ExecutionError::DispatchFailed(e.to_string()))?;

        let output = match share.read_file("output/results.json").await {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(_) => None,
        };

        info!(
            exit_code = guest_result.exit_code,
            duration_seconds, "execution finished"
        );

        Ok(ExecutionResult {
            success: guest_result.exit_code == 0,
            exit_code: guest_result.exit_code,
            stdout: guest_result.stdout,
            stderr: guest_result.stderr,
            duration_seconds,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn rejects_missing_workspace() {
        let executor = AgentExecutor::new(ExecutorConfig::default());
        let (client, _server) = duplex(4096);
        let mut vsock = VsockProtocol::from_stream(3, 9000, client).unwrap();
        let mut share = FilesystemShare::new(tempfile::tempdir().unwrap().path()).unwrap();
        let err = executor
            .execute(
                &mut vsock,
                &mut share,
                b"print(1)",
                Path::new("/nonexistent/path/for/sure"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::WorkspaceMissing(_)));
    }

    #[tokio::test]
    async fn rejects_empty_code() {
        let executor = AgentExecutor::new(ExecutorConfig::default());
        let (client, _server) = duplex(4096);
        let mut vsock = VsockProtocol::from_stream(3, 9000, client).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut share = FilesystemShare::new(dir.path()).unwrap();
        let err = executor
            .execute(&mut vsock, &mut share, b"", dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::EmptyCode));
    }

    #[tokio::test]
    async fn rejects_timeout_over_max() {
        let config = ExecutorConfig::new(Duration::from_secs(5), Duration::from_secs(10)).unwrap();
        let executor = AgentExecutor::new(config);
        let (client, _server) = duplex(4096);
        let mut vsock = VsockProtocol::from_stream(3, 9000, client).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut share = FilesystemShare::new(dir.path()).unwrap();
        let err = executor
            .execute(
                &mut vsock,
                &mut share,
                b"print(1)",
                dir.path(),
                Some(Duration::from_secs(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::TimeoutExceedsMax { .. }));
    }

    #[tokio::test]
    async fn times_out_when_guest_never_responds() {
        let config = ExecutorConfig::new(Duration::from_millis(50), Duration::from_secs(5)).unwrap();
        let executor = AgentExecutor::new(config);
        let (client, _server) = duplex(4096); // server end never answers
        let mut vsock = VsockProtocol::from_stream(3, 9000, client).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut share = FilesystemShare::new(dir.path()).unwrap();
        let err = executor
            .execute(&mut vsock, &mut share, b"print(1)", dir.path(), None)
            .await
            .unwrap_err();
        match err {
            ExecutionError::TimedOut(secs) => assert_eq!(secs, 0),
            other => panic!("expected TimedOut, got {other:?}"),
        }
        assert!(!share.is_mounted());
    }

    #[test]
    fn executor_config_rejects_default_over_max() {
        let err = ExecutorConfig::new(Duration::from_secs(100), Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, ExecutionError::DefaultExceedsMax));
    }
}
