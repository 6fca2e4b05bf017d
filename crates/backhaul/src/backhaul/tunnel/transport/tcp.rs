//! TCP transport with yamux multiplexing layered on top, for networks where
//! UDP (and so QUIC) is filtered. Sessions and streams behave exactly like
//! their QUIC counterparts.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

use crate::backhaul::tunnel::transport::{
    BoxedStream, Transport, TransportDialOptions, TransportListenOptions, TransportListener,
    TransportSession,
};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        addr: &str,
        _opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let ln = TcpListener::bind(addr.trim()).await?;
        Ok(Box::new(TcpTransportListener { ln }))
    }

    async fn dial(
        &self,
        addr: &str,
        _opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let conn = TcpStream::connect(addr.trim()).await?;
        Ok(Arc::new(YamuxSession::client(conn)))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let (conn, _) = self.ln.accept().await?;
        Ok(Arc::new(YamuxSession::server(conn)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Dropping the listener closes it; nothing async to do.
        Ok(())
    }
}

struct YamuxSession {
    control: tokio::sync::Mutex<tokio_yamux::Control>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    remote: Option<SocketAddr>,
    pump: tokio::task::JoinHandle<()>,
}

impl YamuxSession {
    fn server(conn: TcpStream) -> Self {
        let remote = conn.peer_addr().ok();
        let session = tokio_yamux::Session::new_server(conn, tokio_yamux::Config::default());
        Self::from_session(session, remote)
    }

    fn client(conn: TcpStream) -> Self {
        let remote = conn.peer_addr().ok();
        let session = tokio_yamux::Session::new_client(conn, tokio_yamux::Config::default());
        Self::from_session(session, remote)
    }

    fn from_session(
        mut session: tokio_yamux::Session<TcpStream>,
        remote: Option<SocketAddr>,
    ) -> Self {
        let control = session.control();

        // The session must be polled for anything to move; the pump drives
        // it and hands inbound streams to accept_stream.
        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(64);
        let pump = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(stream) => {
                        if tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            control: tokio::sync::Mutex::new(control),
            incoming: tokio::sync::Mutex::new(rx),
            remote,
            pump,
        }
    }
}

#[async_trait]
impl TransportSession for YamuxSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut ctrl = self.control.lock().await;
        let stream = ctrl.open_stream().await?;
        Ok(Box::new(stream))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let stream = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("transport: session closed"))?;
        Ok(Box::new(stream))
    }

    async fn close(&self) {
        self.pump.abort();
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

impl Drop for YamuxSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
