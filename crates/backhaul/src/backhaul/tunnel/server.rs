use std::sync::Arc;

use tokio::net::TcpListener;

use crate::backhaul::{
    config::ServerConfig,
    key, net,
    tunnel::{
        bridge,
        protocol::{self, Frame, FrameResult, SEND_TIMEOUT},
        registry::{Registered, Registry, SessionQueue},
        transport::{transport_by_name, QuicListenOptions, TransportListenOptions, TransportSession},
    },
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub config: ServerConfig,
    pub transport: String,
    pub quic: QuicListenOptions,
}

/// The public broker. Owns its registry, so tests can run several brokers
/// in one process.
pub struct Server {
    opts: ServerOptions,
    registry: Arc<Registry>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        Self {
            opts,
            registry: Arc::new(Registry::new()),
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub async fn listen_and_serve(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let transport = transport_by_name(&self.opts.transport)?;

        let ln = transport
            .listen(
                &net::bind_all(self.opts.config.port).to_string(),
                TransportListenOptions {
                    quic: self.opts.quic.clone(),
                },
            )
            .await?;

        tracing::info!(
            port = self.opts.config.port,
            transport = %transport.name(),
            proxy_ports = %format!("{}-{}", self.opts.config.min_proxy_port, self.opts.config.max_proxy_port),
            "tunnel: control port listening"
        );

        let cfg = Arc::new(self.opts.config.clone());
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                session = ln.accept() => {
                    let session = match session {
                        Ok(s) => s,
                        Err(err) => {
                            tracing::warn!(err = %err, "tunnel: accept failed");
                            continue;
                        }
                    };
                    let cfg = cfg.clone();
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_session(cfg, registry, session).await {
                            tracing::warn!(err = %err, "tunnel: session ended with error");
                        }
                    });
                }
            }
        }

        ln.close().await?;
        Ok(())
    }
}

/// First stream carries the handshake; a valid session then joins its
/// public port's queue of waiting tunnels.
async fn handle_session(
    cfg: Arc<ServerConfig>,
    registry: Arc<Registry>,
    session: Arc<dyn TransportSession>,
) -> anyhow::Result<()> {
    let remote = session
        .remote_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let request = protocol::recv_frame(&*session).await?;

    let verdict = check_request(&cfg, &request);
    if verdict != FrameResult::Success {
        tracing::warn!(
            client = %remote,
            port = request.port,
            verdict = ?verdict,
            "tunnel: session rejected"
        );
        protocol::send_frame(&*session, &request.with_result(verdict)).await?;
        // Closing right away could abandon the verdict in flight; linger
        // until the peer hangs up (it opens no further streams).
        let _ = tokio::time::timeout(SEND_TIMEOUT, session.accept_stream()).await;
        session.close().await;
        return Ok(());
    }

    protocol::send_frame(&*session, &request.with_result(FrameResult::Success)).await?;

    match registry.register(&request, session).await {
        Registered::Enqueued => {
            tracing::debug!(client = %remote, port = request.port, "tunnel: session queued");
        }
        Registered::Created(queue) => {
            tracing::info!(client = %remote, port = request.port, "tunnel: public port activated");
            tokio::spawn(run_public_port(registry, request, queue));
        }
    }
    Ok(())
}

fn check_request(cfg: &ServerConfig, request: &Frame) -> FrameResult {
    if request.version != protocol::PROTOCOL_VERSION {
        return FrameResult::VersionMismatch;
    }
    if !key::verify(&cfg.key, &request.key) {
        return FrameResult::AuthFail;
    }
    if !cfg.port_in_range(request.port) {
        return FrameResult::IllegalPort;
    }
    FrameResult::Success
}

/// One task per active public port: accept external connections and marry
/// each to a waiting tunnel session.
async fn run_public_port(registry: Arc<Registry>, request: Frame, mut queue: SessionQueue) {
    let port = request.port as u16;

    let ln = match TcpListener::bind(net::bind_all(port)).await {
        Ok(ln) => ln,
        Err(err) => {
            tracing::warn!(port, err = %err, "tunnel: public port bind failed");
            registry.remove(port).await;
            return;
        }
    };
    tracing::info!(port, "tunnel: public port listening");

    loop {
        let (external, peer) = match ln.accept().await {
            Ok(a) => a,
            Err(err) => {
                tracing::warn!(port, err = %err, "tunnel: public accept failed");
                continue;
            }
        };

        // A tunnel must show up within the send window; an empty queue past
        // that is indistinguishable from "no client holds this port".
        let session = match tokio::time::timeout(SEND_TIMEOUT, queue.recv()).await {
            Ok(Some(session)) => session,
            Ok(None) | Err(_) => {
                tracing::warn!(port, peer = %peer, "tunnel: no ready session, tearing port down");
                registry.remove(port).await;
                return;
            }
        };

        let stream = match session.open_stream().await {
            Ok(stream) => stream,
            Err(err) => {
                // The popped tunnel was dead; it is not re-enqueued. The
                // external peer gets a reset and may retry.
                tracing::warn!(port, peer = %peer, err = %err, "tunnel: stream open failed");
                continue;
            }
        };

        tracing::debug!(port, peer = %peer, "tunnel: bridging connection");
        tokio::spawn(bridge::forward(external, stream));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backhaul::tunnel::protocol::{read_frame, write_frame, PROTOCOL_VERSION};
    use crate::backhaul::tunnel::transport::BoxedStream;
    use tokio::io::DuplexStream;
    use tokio::sync::Mutex;

    fn test_config() -> ServerConfig {
        ServerConfig {
            key: "Aulang".into(),
            port: 8888,
            min_proxy_port: 10000,
            max_proxy_port: 20000,
        }
    }

    #[test]
    fn request_validation_order_and_codes() {
        let cfg = test_config();

        let good = Frame::request(17001, "Aulang".into());
        assert_eq!(check_request(&cfg, &good), FrameResult::Success);

        let mut stale = good.clone();
        stale.version = PROTOCOL_VERSION - 1;
        assert_eq!(check_request(&cfg, &stale), FrameResult::VersionMismatch);

        let wrong_key = Frame::request(17001, "Wrong".into());
        assert_eq!(check_request(&cfg, &wrong_key), FrameResult::AuthFail);

        let low = Frame::request(9999, "Aulang".into());
        assert_eq!(check_request(&cfg, &low), FrameResult::IllegalPort);
        let min_edge = Frame::request(10000, "Aulang".into());
        assert_eq!(check_request(&cfg, &min_edge), FrameResult::IllegalPort);
        let max_edge = Frame::request(20000, "Aulang".into());
        assert_eq!(check_request(&cfg, &max_edge), FrameResult::IllegalPort);

        // A bad key outranks a bad port; a bad version outranks both.
        let bad_key_and_port = Frame::request(9999, "Wrong".into());
        assert_eq!(check_request(&cfg, &bad_key_and_port), FrameResult::AuthFail);
        let mut all_bad = bad_key_and_port;
        all_bad.version = 0;
        assert_eq!(check_request(&cfg, &all_bad), FrameResult::VersionMismatch);
    }

    /// A session whose inbound streams are scripted and whose outbound
    /// streams are captured for inspection.
    struct ScriptedSession {
        inbound: Mutex<Vec<BoxedStream>>,
        opened: Mutex<Vec<DuplexStream>>,
    }

    impl ScriptedSession {
        async fn with_handshake(frame: &Frame) -> Arc<Self> {
            // Small frame, fits the duplex buffer without blocking.
            let (mut near, far) = tokio::io::duplex(512);
            use tokio::io::AsyncWriteExt;
            write_frame(&mut near, frame).await.unwrap();
            near.shutdown().await.unwrap();
            Arc::new(Self {
                inbound: Mutex::new(vec![Box::new(far)]),
                opened: Mutex::new(Vec::new()),
            })
        }

        async fn next_reply(&self) -> Frame {
            let mut far = self.opened.lock().await.remove(0);
            read_frame(&mut far).await.unwrap()
        }
    }

    #[async_trait::async_trait]
    impl TransportSession for ScriptedSession {
        async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
            let (near, far) = tokio::io::duplex(512);
            self.opened.lock().await.push(far);
            Ok(Box::new(near))
        }

        async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
            let mut inbound = self.inbound.lock().await;
            if inbound.is_empty() {
                anyhow::bail!("no more scripted streams");
            }
            Ok(inbound.remove(0))
        }

        async fn close(&self) {}

        fn remote_addr(&self) -> Option<std::net::SocketAddr> {
            None
        }
    }

    #[tokio::test]
    async fn rejected_sessions_never_reach_the_registry() {
        let cfg = Arc::new(test_config());
        let registry = Arc::new(Registry::new());

        for (frame, expect) in [
            (Frame::request(17001, "Wrong".into()), FrameResult::AuthFail),
            (
                Frame {
                    version: PROTOCOL_VERSION + 1,
                    ..Frame::request(17001, "Aulang".into())
                },
                FrameResult::VersionMismatch,
            ),
            (
                Frame::request(9999, "Aulang".into()),
                FrameResult::IllegalPort,
            ),
        ] {
            let session = ScriptedSession::with_handshake(&frame).await;
            handle_session(cfg.clone(), registry.clone(), session.clone())
                .await
                .unwrap();

            let reply = session.next_reply().await;
            assert_eq!(reply.result, expect);
            assert!(!registry.contains(frame.port as u16).await);
        }
    }

    #[tokio::test]
    async fn accepted_session_gets_success_reply_and_port_entry() {
        let cfg = Arc::new(test_config());
        let registry = Arc::new(Registry::new());

        let frame = Frame::request(17001, "Aulang".into());
        let session = ScriptedSession::with_handshake(&frame).await;
        handle_session(cfg, registry.clone(), session.clone())
            .await
            .unwrap();

        let reply = session.next_reply().await;
        assert_eq!(reply.result, FrameResult::Success);
        assert_eq!(reply.port, 17001);
        assert!(registry.contains(17001).await);
    }

    #[tokio::test]
    async fn generated_credential_is_accepted() {
        let cfg = Arc::new(test_config());
        let registry = Arc::new(Registry::new());

        let cred = key::generate("Aulang", None).unwrap();
        let frame = Frame::request(17002, cred);
        let session = ScriptedSession::with_handshake(&frame).await;
        handle_session(cfg, registry.clone(), session.clone())
            .await
            .unwrap();

        assert_eq!(session.next_reply().await.result, FrameResult::Success);
        assert!(registry.contains(17002).await);
    }
}
