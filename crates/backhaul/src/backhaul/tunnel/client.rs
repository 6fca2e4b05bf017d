use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinSet};

use crate::backhaul::{
    config::{ClientConfig, NetAddress},
    tunnel::{
        bridge,
        protocol::{self, Frame, FrameResult},
        transport::{
            dial_with_retry, tcp_dial_with_retry, transport_by_name, QuicDialOptions, Transport,
            TransportDialOptions, TransportSession,
        },
    },
};

/// Dial attempts against the broker before declaring it unreachable.
const SERVER_DIAL_RETRIES: i32 = 10;

/// Dial attempts against the private service before dropping a stream.
const LOCAL_DIAL_RETRIES: i32 = 5;

/// Rejections no amount of retrying can cure; the process exits on them.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("server {0} unreachable")]
    ServerUnreachable(String),
    #[error("protocol version mismatch (ours: {})", protocol::PROTOCOL_VERSION)]
    VersionMismatch,
    #[error("authentication rejected by server")]
    AuthFailed,
    #[error("public port {0} rejected by server")]
    IllegalPort(u32),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub config: ClientConfig,
    pub transport: String,
    pub quic: QuicDialOptions,
}

pub struct Client {
    opts: ClientOptions,
}

impl Client {
    pub fn new(opts: ClientOptions) -> Self {
        Self { opts }
    }

    /// Run one tunnel supervisor per mapping. Returns only when a
    /// supervisor hits a fatal rejection or shutdown is signalled.
    pub async fn run(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let transport = transport_by_name(&self.opts.transport)?;
        let cfg = &self.opts.config;

        let mut supervisors = JoinSet::new();
        for proxy_addr in &cfg.proxy_addrs {
            let runtime = Arc::new(MappingRuntime {
                key: cfg.key.clone(),
                server_addr: cfg.server_addr.addr(),
                proxy_addr: proxy_addr.clone(),
                transport: transport.clone(),
                dial_opts: TransportDialOptions {
                    quic: self.opts.quic.clone(),
                },
            });
            let tunnel_count = cfg.tunnel_count;
            let shutdown = shutdown.clone();
            supervisors.spawn(supervise_mapping(runtime, tunnel_count, shutdown));
        }

        while let Some(res) = supervisors.join_next().await {
            res??;
        }
        Ok(())
    }
}

/// Everything a bring-up task needs about its mapping.
struct MappingRuntime {
    key: String,
    server_addr: String,
    proxy_addr: NetAddress,
    transport: Arc<dyn Transport>,
    dial_opts: TransportDialOptions,
}

/// Keeps `tunnel_count` ready tunnels alive for one mapping. Each unit on
/// the demand channel buys one bring-up attempt; tasks re-push on failure
/// and when they transition from waiting to forwarding.
async fn supervise_mapping(
    runtime: Arc<MappingRuntime>,
    tunnel_count: usize,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (demand_tx, mut demand_rx) = mpsc::unbounded_channel::<()>();
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<FatalError>();

    for _ in 0..tunnel_count {
        let _ = demand_tx.send(());
    }
    tracing::info!(
        mapping = %runtime.proxy_addr,
        tunnels = tunnel_count,
        "tunnel: mapping supervisor started"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            Some(fatal) = fatal_rx.recv() => {
                tracing::error!(mapping = %runtime.proxy_addr, err = %fatal, "tunnel: fatal");
                return Err(fatal.into());
            }
            Some(()) = demand_rx.recv() => {
                let runtime = runtime.clone();
                let demand_tx = demand_tx.clone();
                let fatal_tx = fatal_tx.clone();
                tokio::spawn(bring_up_tunnel(runtime, demand_tx, fatal_tx));
            }
        }
    }
}

/// Dial the broker, handshake, then wait to be handed an external
/// connection.
async fn bring_up_tunnel(
    runtime: Arc<MappingRuntime>,
    demand_tx: mpsc::UnboundedSender<()>,
    fatal_tx: mpsc::UnboundedSender<FatalError>,
) {
    let Some(session) = dial_with_retry(
        &*runtime.transport,
        &runtime.server_addr,
        runtime.dial_opts.clone(),
        SERVER_DIAL_RETRIES,
    )
    .await
    else {
        let _ = fatal_tx.send(FatalError::ServerUnreachable(runtime.server_addr.clone()));
        return;
    };

    let request = Frame::request(u32::from(runtime.proxy_addr.port2), runtime.key.clone());
    if let Err(err) = protocol::send_frame(&*session, &request).await {
        tracing::warn!(err = %err, "tunnel: handshake send failed, replacing tunnel");
        let _ = demand_tx.send(());
        return;
    }

    let reply = match protocol::recv_frame(&*session).await {
        Ok(reply) => reply,
        Err(err) => {
            tracing::warn!(err = %err, "tunnel: handshake reply lost, replacing tunnel");
            let _ = demand_tx.send(());
            return;
        }
    };

    match reply.result {
        FrameResult::Success => bridge_tunnel(runtime, session, demand_tx).await,
        FrameResult::VersionMismatch => {
            let _ = fatal_tx.send(FatalError::VersionMismatch);
        }
        FrameResult::AuthFail => {
            let _ = fatal_tx.send(FatalError::AuthFailed);
        }
        FrameResult::IllegalPort => {
            let _ = fatal_tx.send(FatalError::IllegalPort(request.port));
        }
        _ => {
            // Broker-side hiccup; this tunnel is dead, order a replacement.
            let _ = demand_tx.send(());
        }
    }
}

/// The tunnel is established and idle. Block until the broker opens a data
/// stream, dial the private service, and pump bytes. A replacement demand
/// goes out before forwarding starts so the pool stays at strength.
async fn bridge_tunnel(
    runtime: Arc<MappingRuntime>,
    session: Arc<dyn TransportSession>,
    demand_tx: mpsc::UnboundedSender<()>,
) {
    let stream = match session.accept_stream().await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(err = %err, "tunnel: lost while waiting, replacing");
            let _ = demand_tx.send(());
            return;
        }
    };

    let local_addr = runtime.proxy_addr.addr();
    let local = tcp_dial_with_retry(&local_addr, LOCAL_DIAL_RETRIES).await;

    let _ = demand_tx.send(());

    match local {
        Some(conn) => {
            tracing::debug!(mapping = %runtime.proxy_addr, "tunnel: bridging to private service");
            bridge::forward(stream, conn).await;
        }
        None => {
            tracing::warn!(
                addr = %local_addr,
                "tunnel: private service unreachable, dropping stream"
            );
            // Dropping the stream resets it; the broker's side sees the
            // error and the external peer gets cut off.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_render_their_cause() {
        assert!(FatalError::AuthFailed.to_string().contains("authentication"));
        assert!(FatalError::IllegalPort(9999).to_string().contains("9999"));
        assert!(FatalError::VersionMismatch.to_string().contains("version"));
        assert!(
            FatalError::ServerUnreachable("example.com:8888".into())
                .to_string()
                .contains("example.com:8888")
        );
    }
}
