use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use pin_project_lite::pin_project;
use quinn::{Connection, Endpoint, TransportConfig};

use crate::backhaul::net;
use crate::backhaul::tunnel::transport::{
    BoxedStream, QuicDialOptions, QuicListenOptions, Transport, TransportDialOptions,
    TransportListenOptions, TransportListener, TransportSession,
};

/// Application protocol announced on every tunnel session.
const ALPN: &[u8] = b"quic";

const MAX_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE: Duration = Duration::from_secs(20);

pub struct QuicTransport;

impl QuicTransport {
    pub fn new() -> Self {
        Self
    }
}

fn transport_config() -> anyhow::Result<TransportConfig> {
    let mut cfg = TransportConfig::default();
    cfg.max_idle_timeout(Some(MAX_IDLE.try_into()?));
    cfg.keep_alive_interval(Some(KEEPALIVE));
    Ok(cfg)
}

#[async_trait]
impl Transport for QuicTransport {
    fn name(&self) -> &'static str {
        "quic"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let addr: SocketAddr = addr.trim().parse()?;
        let QuicListenOptions {
            cert_file,
            key_file,
        } = opts.quic;

        let (cert_chain, key) = tls::load_or_generate_cert(cert_file, key_file)?;
        let server_crypto = tls::server_crypto_config(cert_chain, key)?;

        let mut server_cfg = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
        ));
        server_cfg.transport_config(Arc::new(transport_config()?));

        let endpoint = Endpoint::server(server_cfg, addr)?;
        Ok(Box::new(QuicListener { endpoint }))
    }

    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let QuicDialOptions {
            server_name,
            insecure_skip_verify,
        } = opts.quic;

        let client_crypto = tls::client_crypto_config(insecure_skip_verify)?;
        let mut client_cfg = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
        ));
        client_cfg.transport_config(Arc::new(transport_config()?));

        let mut endpoint = Endpoint::client(net::bind_all(0))?;
        endpoint.set_default_client_config(client_cfg);

        let name = if server_name.trim().is_empty() {
            "localhost".to_string()
        } else {
            server_name
        };

        let remote = resolve_socket_addr(addr).await?;
        let conn = endpoint.connect(remote, &name)?.await?;
        Ok(Arc::new(QuicSession { conn }))
    }
}

async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("transport: could not resolve {addr:?}"))
}

pub struct QuicListener {
    endpoint: Endpoint,
}

#[async_trait]
impl TransportListener for QuicListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| anyhow::anyhow!("transport: quic endpoint closed"))?;
        let conn = incoming.await?;
        Ok(Arc::new(QuicSession { conn }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.endpoint.close(0u32.into(), b"");
        Ok(())
    }
}

struct QuicSession {
    conn: Connection,
}

#[async_trait]
impl TransportSession for QuicSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let (send, recv) = self.conn.open_bi().await?;
        Ok(Box::new(QuicStream { send, recv }))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let (send, recv) = self.conn.accept_bi().await?;
        Ok(Box::new(QuicStream { send, recv }))
    }

    async fn close(&self) {
        self.conn.close(0u32.into(), b"");
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.conn.remote_address())
    }
}

pin_project! {
    struct QuicStream {
        #[pin]
        send: quinn::SendStream,
        #[pin]
        recv: quinn::RecvStream,
    }
}

impl tokio::io::AsyncRead for QuicStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncRead::poll_read(self.project().recv, cx, buf)
    }
}

impl tokio::io::AsyncWrite for QuicStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        tokio::io::AsyncWrite::poll_write(self.project().send, cx, data)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_flush(self.project().send, cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        tokio::io::AsyncWrite::poll_shutdown(self.project().send, cx)
    }
}

mod tls {
    use std::{fs, path::Path, sync::Arc};

    use rcgen::generate_simple_self_signed;
    use rustls::{
        client::danger::{ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    };

    use super::ALPN;

    /// Certificates come from the configured PEM files when both are set;
    /// otherwise a fresh self-signed certificate is generated. Peers dial
    /// with verification disabled, so the generated certificate only has to
    /// exist.
    pub fn load_or_generate_cert(
        cert_file: String,
        key_file: String,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert_file = cert_file.trim();
        let key_file = key_file.trim();

        if !cert_file.is_empty() || !key_file.is_empty() {
            if cert_file.is_empty() || key_file.is_empty() {
                anyhow::bail!(
                    "transport: quic needs both cert_file and key_file (or neither to auto-generate)"
                );
            }
            let certs = load_certs(Path::new(cert_file))?;
            let key = load_key(Path::new(key_file))?;
            return Ok((certs, key));
        }

        let rcgen::CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(["localhost".to_string()])?;
        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
        Ok((vec![cert_der], key_der))
    }

    fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let data = fs::read(path)?;
        let mut rd = std::io::Cursor::new(&data);
        let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
        Ok(certs)
    }

    fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
        let data = fs::read(path)?;
        let mut rd = std::io::Cursor::new(&data);
        let Some(key) = rustls_pemfile::private_key(&mut rd)? else {
            anyhow::bail!("transport: no private key found in {}", path.display());
        };
        Ok(key)
    }

    pub fn server_crypto_config(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> anyhow::Result<rustls::ServerConfig> {
        let mut cfg = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        cfg.alpn_protocols = vec![ALPN.to_vec()];
        Ok(cfg)
    }

    pub fn client_crypto_config(insecure_skip_verify: bool) -> anyhow::Result<rustls::ClientConfig> {
        if insecure_skip_verify {
            let mut cfg = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth();
            cfg.alpn_protocols = vec![ALPN.to_vec()];
            return Ok(cfg);
        }

        let root = rustls::RootCertStore::empty();
        let mut cfg = rustls::ClientConfig::builder()
            .with_root_certificates(root)
            .with_no_client_auth();
        cfg.alpn_protocols = vec![ALPN.to_vec()];
        Ok(cfg)
    }

    /// Certificate verifier that accepts anything. The broker's certificate
    /// is self-signed and rotates on every start, so clients cannot pin it.
    #[derive(Debug)]
    struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

    impl SkipServerVerification {
        fn new() -> Arc<Self> {
            Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
        }
    }

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
