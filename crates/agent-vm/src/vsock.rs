//! Framed, checksummed request/response protocol over a vsock connection.

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_vsock::{VsockAddr, VsockStream};
use tracing::debug;

use crate::error::VsockError;

const CHECKSUM_HEX_LEN: usize = 64;
const HEADER_LEN: usize = 8;

/// `{command, payload, checksum}`. Immutable after construction; the
/// checksum is computed once here and only ever recomputed on receive, for
/// verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsockMessage {
    command: String,
    payload: Bytes,
}

impl VsockMessage {
    pub fn new(command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Lower-case hex sha-256 of `command_bytes ‖ payload`.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.command.as_bytes());
        hasher.update(&self.payload);
        hex::encode(hasher.finalize())
    }

    /// Serializes to the bit-exact frame layout documented on `VsockProtocol`.
    pub fn encode(&self) -> Vec<u8> {
        let cmd_bytes = self.command.as_bytes();
        let mut frame =
            Vec::with_capacity(HEADER_LEN + cmd_bytes.len() + self.payload.len() + CHECKSUM_HEX_LEN);
        frame.extend_from_slice(&(cmd_bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(cmd_bytes);
        frame.extend_from_slice(&self.payload);
        frame.extend_from_slice(self.checksum().as_bytes());
        frame
    }
}

/// Connection-oriented framing over `{cid, port}`. Port defaults to 9000;
/// cid must be positive, port in `1..=65535`.
///
/// Generic over the underlying stream so the frame codec itself can be
/// exercised in tests over an in-memory duplex, independent of the real
/// vsock transport.
pub struct VsockProtocol<S> {
    cid: u32,
    port: u32,
    stream: Option<S>,
}

impl VsockProtocol<VsockStream> {
    /// Opens a real vsock connection to `{cid, port}`.
    pub async fn connect(cid: u32, port: u32) -> Result<Self, VsockError> {
        validate_endpoint(cid, port)?;
        let addr = VsockAddr::new(cid, port);
        let stream = VsockStream::connect(addr).await?;
        Ok(Self {
            cid,
            port,
            stream: Some(stream),
        })
    }
}

impl<S> VsockProtocol<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an already-open stream (used by tests against an in-memory
    /// duplex, and by callers bringing their own transport).
    pub fn from_stream(cid: u32, port: u32, stream: S) -> Result<Self, VsockError> {
        validate_endpoint(cid, port)?;
        Ok(Self {
            cid,
            port,
            stream: Some(stream),
        })
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    /// Writes the full frame, retrying on partial writes until complete.
    pub async fn send(&mut self, message: &VsockMessage) -> Result<(), VsockError> {
        let stream = self.stream.as_mut().ok_or(VsockError::SocketNotInitialized)?;
        let frame = message.encode();
        stream.write_all(&frame).await?;
        stream.flush().await?;
        debug!(command = message.command(), len = frame.len(), "frame sent");
        Ok(())
    }

    /// Exactly four reads: header, command, payload, checksum. Any short
    /// read fails with `VsockError::UnexpectedEof`; a checksum mismatch
    /// fails with `VsockError::ChecksumMismatch`.
    pub async fn receive(&mut self) -> Result<VsockMessage, VsockError> {
        let stream = self.stream.as_mut().ok_or(VsockError::SocketNotInitialized)?;

        let mut header = [0u8; HEADER_LEN];
        read_exact_or_eof(stream, &mut header, "header").await?;
        let cmd_len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
        let payload_len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;

        let mut cmd_bytes = vec![0u8; cmd_len];
        read_exact_or_eof(stream, &mut cmd_bytes, "command").await?;
        let command = String::from_utf8(cmd_bytes)?;

        let mut payload = BytesMut::zeroed(payload_len);
        read_exact_or_eof(stream, &mut payload, "payload").await?;

        let mut checksum_bytes = [0u8; CHECKSUM_HEX_LEN];
        read_exact_or_eof(stream, &mut checksum_bytes, "checksum").await?;
        let received_checksum = String::from_utf8(checksum_bytes.to_vec())?;

        let message = VsockMessage {
            command,
            payload: payload.freeze(),
        };
        let expected = message.checksum();
        if expected != received_checksum {
            return Err(VsockError::ChecksumMismatch {
                expected,
                actual: received_checksum,
            });
        }
        Ok(message)
    }
}

async fn read_exact_or_eof<S>(
    stream: &mut S,
    buf: &mut [u8],
    what: &'static str,
) -> Result<(), VsockError>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(VsockError::UnexpectedEof(what))
        }
        Err(e) => Err(VsockError::Io(e)),
    }
}

fn validate_endpoint(cid: u32, port: u32) -> Result<(), VsockError> {
    if cid == 0 {
        return Err(VsockError::InvalidCid(cid));
    }
    if port == 0 || port > 65535 {
        return Err(VsockError::InvalidPort(port));
    }
    Ok(())
}

pub const DEFAULT_PORT: u32 = 9000;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn ping_frame_is_bit_exact() {
        let msg = VsockMessage::new("ping", b"".to_vec());
        let frame = msg.encode();
        assert_eq!(&frame[0..8], &[0, 0, 0, 4, 0, 0, 0, 0]);
        assert_eq!(&frame[8..12], b"ping");
        let mut hasher = Sha256::new();
        hasher.update(b"ping");
        let expected = hex::encode(hasher.finalize());
        assert_eq!(&frame[12..], expected.as_bytes());
    }

    #[tokio::test]
    async fn round_trip_over_duplex() {
        let (client, server) = duplex(4096);
        let mut sender = VsockProtocol::from_stream(3, 9000, client).unwrap();
        let mut receiver = VsockProtocol::from_stream(3, 9000, server).unwrap();

        let msg = VsockMessage::new("execute", b"/mnt/agent/input/agent.py".to_vec());
        sender.send(&msg).await.unwrap();
        let received = receiver.receive().await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn single_bit_mutation_fails_checksum() {
        let (client, server) = duplex(4096);
        let mut sender = VsockProtocol::from_stream(3, 9000, client).unwrap();
        let mut receiver = VsockProtocol::from_stream(3, 9000, server).unwrap();

        let msg = VsockMessage::new("ping", b"hello".to_vec());
        let mut frame = msg.encode();
        frame[9] ^= 0x01; // flip a bit inside the command bytes, outside the checksum
        sender.send_raw_for_test(frame).await;

        let err = receiver.receive().await.unwrap_err();
        assert!(matches!(err, VsockError::ChecksumMismatch { .. }));
    }

    impl<S> VsockProtocol<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        async fn send_raw_for_test(&mut self, frame: Vec<u8>) {
            let stream = self.stream.as_mut().unwrap();
            stream.write_all(&frame).await.unwrap();
            stream.flush().await.unwrap();
        }
    }

    #[test]
    fn invalid_cid_rejected() {
        let err = validate_endpoint(0, 9000).unwrap_err();
        assert!(matches!(err, VsockError::InvalidCid(0)));
    }

    #[test]
    fn invalid_port_rejected() {
        assert!(validate_endpoint(3, 0).is_err());
        assert!(validate_endpoint(3, 70000).is_err());
    }
}
