use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Fixed pause between dial attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// A bidirectional async byte stream.
///
/// Trait objects carry a single principal trait, so `AsyncRead + AsyncWrite`
/// are folded into one.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, Clone, Default)]
pub struct QuicListenOptions {
    /// PEM certificate chain; generated fresh when empty.
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct QuicDialOptions {
    pub server_name: String,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TransportListenOptions {
    pub quic: QuicListenOptions,
}

#[derive(Debug, Clone, Default)]
pub struct TransportDialOptions {
    pub quic: QuicDialOptions,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// A long-lived multiplexed association. Streams are cheap; the first one of
/// a session carries the handshake, each later one carries one brokered
/// connection.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream>;
    /// Blocks until the peer opens a stream.
    async fn accept_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn close(&self);
    fn remote_addr(&self) -> Option<SocketAddr>;
}

pub mod quic;
pub mod tcp;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "quic".into();
    }
    match n.as_str() {
        "quic" => Ok(Arc::new(quic::QuicTransport::new())),
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        _ => anyhow::bail!("transport: unknown transport {name:?} (expected quic|tcp)"),
    }
}

/// Dial a tunnel session, sleeping [`RETRY_INTERVAL`] between attempts.
/// A negative `max_retries` keeps dialing forever.
pub async fn dial_with_retry(
    transport: &dyn Transport,
    addr: &str,
    opts: TransportDialOptions,
    max_retries: i32,
) -> Option<Arc<dyn TransportSession>> {
    let mut attempts: i32 = 0;
    loop {
        match transport.dial(addr, opts.clone()).await {
            Ok(session) => return Some(session),
            Err(err) => {
                attempts += 1;
                if max_retries >= 0 && attempts >= max_retries {
                    tracing::warn!(addr = %addr, err = %err, "transport: dial failed, giving up");
                    return None;
                }
                tracing::warn!(
                    addr = %addr,
                    err = %err,
                    attempt = attempts,
                    "transport: dial failed, retrying in 5s"
                );
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

/// Plain TCP dial with the same retry shape, for the client's private
/// service side.
pub async fn tcp_dial_with_retry(addr: &str, max_retries: i32) -> Option<TcpStream> {
    let mut attempts: i32 = 0;
    loop {
        match TcpStream::connect(addr).await {
            Ok(conn) => return Some(conn),
            Err(err) => {
                attempts += 1;
                if max_retries >= 0 && attempts >= max_retries {
                    tracing::warn!(addr = %addr, err = %err, "transport: tcp dial failed, giving up");
                    return None;
                }
                tracing::warn!(
                    addr = %addr,
                    err = %err,
                    attempt = attempts,
                    "transport: tcp dial failed, retrying in 5s"
                );
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}
