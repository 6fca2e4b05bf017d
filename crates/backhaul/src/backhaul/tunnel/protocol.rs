//! Control frames.
//!
//! One frame per stream: the sender opens a fresh stream, writes
//! `[len u8][result u8][version u32 BE][port u32 BE][key utf8]` and closes
//! it; the receiver accepts the stream and reads the single frame. The
//! length byte covers the payload only, so a frame is at most 256 bytes on
//! the wire.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::backhaul::tunnel::transport::TransportSession;

/// Baked into both peers; any mismatch is fatal for the client.
pub const PROTOCOL_VERSION: u32 = 5;

/// Bound on frame writes (a half-open peer must not wedge a sender). Also
/// the broker's patience when waiting for a ready tunnel session.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// result(1) + version(4) + port(4) + at least one key byte.
const MIN_PAYLOAD_BYTES: usize = 10;

/// The length prefix is a single byte, so the key gets what remains.
pub const MAX_KEY_BYTES: usize = u8::MAX as usize - MIN_PAYLOAD_BYTES + 1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("key of {0} bytes exceeds the {MAX_KEY_BYTES}-byte frame limit")]
    KeyTooLong(usize),
    #[error("frame write timed out")]
    SendTimeout,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameResult {
    Fail = 0,
    Success = 1,
    RecvFail = 2,
    AuthFail = 3,
    VersionMismatch = 4,
    IllegalPort = 5,
}

impl FrameResult {
    /// Unknown codes collapse to `Fail`; callers treat both as "replace the
    /// tunnel", which is also what the wire's default result means.
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FrameResult::Success,
            2 => FrameResult::RecvFail,
            3 => FrameResult::AuthFail,
            4 => FrameResult::VersionMismatch,
            5 => FrameResult::IllegalPort,
            _ => FrameResult::Fail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub result: FrameResult,
    pub version: u32,
    /// Requested public broker-side port.
    pub port: u32,
    pub key: String,
}

impl Frame {
    /// A client's handshake request for `port`.
    pub fn request(port: u32, key: String) -> Self {
        Self {
            result: FrameResult::Success,
            version: PROTOCOL_VERSION,
            port,
            key,
        }
    }

    /// The same request, restamped with a verdict.
    pub fn with_result(&self, result: FrameResult) -> Self {
        Self {
            result,
            ..self.clone()
        }
    }

    fn failed(result: FrameResult) -> Self {
        Self {
            result,
            version: 0,
            port: 0,
            key: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == FrameResult::Success
    }

    /// `[len][payload]` bytes ready for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let key = self.key.as_bytes();
        if key.is_empty() || key.len() > MAX_KEY_BYTES {
            return Err(ProtocolError::KeyTooLong(key.len()));
        }

        let payload_len = MIN_PAYLOAD_BYTES - 1 + key.len();
        let mut out = Vec::with_capacity(1 + payload_len);
        out.push(payload_len as u8);
        out.push(self.result as u8);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(key);
        Ok(out)
    }

    /// Decode a payload (without the length byte). Short payloads are not an
    /// error: they decode to a `Fail` frame.
    pub fn decode_payload(body: &[u8]) -> Self {
        if body.len() < MIN_PAYLOAD_BYTES {
            return Frame::failed(FrameResult::Fail);
        }
        Self {
            result: FrameResult::from_u8(body[0]),
            version: u32::from_be_bytes(body[1..5].try_into().expect("4 bytes")),
            port: u32::from_be_bytes(body[5..9].try_into().expect("4 bytes")),
            key: String::from_utf8_lossy(&body[9..]).into_owned(),
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    let bytes = frame.encode()?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, ProtocolError> {
    let len = r.read_u8().await? as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(Frame::decode_payload(&body))
}

/// Send one frame on a freshly opened stream, bounded by [`SEND_TIMEOUT`].
pub async fn send_frame(session: &dyn TransportSession, frame: &Frame) -> anyhow::Result<()> {
    let mut stream = session.open_stream().await?;

    let write = async {
        write_frame(&mut stream, frame).await?;
        stream.shutdown().await?;
        Ok::<(), ProtocolError>(())
    };
    tokio::time::timeout(SEND_TIMEOUT, write)
        .await
        .map_err(|_| ProtocolError::SendTimeout)??;
    Ok(())
}

/// Receive one frame from the next incoming stream. Deliberately not
/// deadlined: the broker parks here until a peer pushes its handshake, and
/// the client parks here awaiting the broker's reply.
pub async fn recv_frame(session: &dyn TransportSession) -> anyhow::Result<Frame> {
    let mut stream = session.accept_stream().await?;
    let frame = read_frame(&mut stream).await?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(512);

        let frame = Frame::request(17001, "Aulang".into());
        write_frame(&mut a, &frame).await.unwrap();

        let got = read_frame(&mut b).await.unwrap();
        assert_eq!(got, frame);
        assert!(got.is_success());
        assert!(!got.with_result(FrameResult::AuthFail).is_success());
    }

    #[tokio::test]
    async fn frame_roundtrip_max_key() {
        let (mut a, mut b) = tokio::io::duplex(512);

        let frame = Frame {
            result: FrameResult::IllegalPort,
            version: PROTOCOL_VERSION,
            port: u32::from(u16::MAX),
            key: "k".repeat(MAX_KEY_BYTES),
        };
        write_frame(&mut a, &frame).await.unwrap();

        let got = read_frame(&mut b).await.unwrap();
        assert_eq!(got, frame);
    }

    #[test]
    fn oversized_and_empty_keys_are_rejected() {
        let too_long = Frame::request(1, "k".repeat(MAX_KEY_BYTES + 1));
        assert!(matches!(
            too_long.encode(),
            Err(ProtocolError::KeyTooLong(_))
        ));

        let empty = Frame::request(1, String::new());
        assert!(empty.encode().is_err());
    }

    #[test]
    fn short_payload_decodes_to_fail() {
        let f = Frame::decode_payload(&[1, 0, 0, 0, 5]);
        assert_eq!(f.result, FrameResult::Fail);
        assert_eq!(f.port, 0);
        assert!(f.key.is_empty());
    }

    #[test]
    fn unknown_result_code_collapses_to_fail() {
        assert_eq!(FrameResult::from_u8(99), FrameResult::Fail);
        assert_eq!(FrameResult::from_u8(1), FrameResult::Success);

        let mut body = vec![99u8];
        body.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        body.extend_from_slice(&17001u32.to_be_bytes());
        body.extend_from_slice(b"k");
        assert_eq!(Frame::decode_payload(&body).result, FrameResult::Fail);
    }

    #[tokio::test]
    async fn truncated_stream_is_an_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);

        // Length byte promises more than the stream delivers.
        a.write_all(&[20, 1, 2, 3]).await.unwrap();
        drop(a);

        assert!(matches!(
            read_frame(&mut b).await,
            Err(ProtocolError::Io(_))
        ));
    }
}
