//! Loopback scenarios: a real broker, a real client, and a private echo
//! service, glued together over QUIC (and once over TCP+yamux).

use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};

use backhaul::backhaul::config::{ClientConfig, NetAddress, ServerConfig};
use backhaul::backhaul::tunnel::{
    client::{Client, ClientOptions},
    server::{Server, ServerOptions},
    transport::{QuicDialOptions, QuicListenOptions},
};

/// Grab an ephemeral TCP port and release it for the code under test.
fn free_tcp_port() -> u16 {
    let ln = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral tcp");
    ln.local_addr().expect("local addr").port()
}

fn free_udp_port() -> u16 {
    let sock = std::net::UdpSocket::bind(("127.0.0.1", 0)).expect("bind ephemeral udp");
    sock.local_addr().expect("local addr").port()
}

/// A private service that echoes whatever it receives.
async fn start_echo() -> (u16, JoinHandle<()>) {
    let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let port = ln.local_addr().expect("echo addr").port();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = ln.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    (port, task)
}

struct Broker {
    server: Arc<Server>,
    control_port: u16,
    shutdown: watch::Sender<bool>,
    _task: JoinHandle<anyhow::Result<()>>,
}

fn start_broker(key: &str, transport: &str, min_port: u16, max_port: u16) -> Broker {
    let control_port = match transport {
        "tcp" => free_tcp_port(),
        _ => free_udp_port(),
    };

    let server = Arc::new(Server::new(ServerOptions {
        config: ServerConfig {
            key: key.into(),
            port: control_port,
            min_proxy_port: min_port,
            max_proxy_port: max_port,
        },
        transport: transport.into(),
        quic: QuicListenOptions::default(),
    }));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = {
        let server = server.clone();
        tokio::spawn(async move { server.listen_and_serve(shutdown_rx).await })
    };

    Broker {
        server,
        control_port,
        shutdown,
        _task: task,
    }
}

fn start_client(
    key: &str,
    transport: &str,
    control_port: u16,
    mapping: NetAddress,
    tunnel_count: usize,
) -> (watch::Sender<bool>, JoinHandle<anyhow::Result<()>>) {
    let client = Client::new(ClientOptions {
        config: ClientConfig {
            key: key.into(),
            server_addr: NetAddress::new("127.0.0.1", control_port, control_port),
            proxy_addrs: vec![mapping],
            tunnel_count,
        },
        transport: transport.into(),
        quic: QuicDialOptions {
            server_name: "localhost".into(),
            insecure_skip_verify: true,
        },
    });

    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move { client.run(shutdown_rx).await });
    (shutdown, task)
}

/// The public port opens some time after the client registers; poll for it.
async fn connect_public(port: u16) -> TcpStream {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(conn) => return conn,
            Err(err) => {
                if tokio::time::Instant::now() >= deadline {
                    panic!("public port {port} never opened: {err}");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn round_trip(conn: &mut TcpStream, payload: &[u8]) {
    conn.write_all(payload).await.expect("write through tunnel");
    let mut got = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), conn.read_exact(&mut got))
        .await
        .expect("echo reply within 10s")
        .expect("read through tunnel");
    assert_eq!(got, payload);
}

#[tokio::test]
async fn quic_round_trip_through_public_port() {
    let (echo_port, _echo) = start_echo().await;
    let public_port = free_tcp_port();

    let broker = start_broker("Aulang", "quic", 1023, 65535);
    let (_client_shutdown, _client) = start_client(
        "Aulang",
        "quic",
        broker.control_port,
        NetAddress::new("127.0.0.1", echo_port, public_port),
        2,
    );

    let mut conn = connect_public(public_port).await;
    round_trip(&mut conn, b"hello backhaul").await;
    drop(conn);

    assert!(broker.server.registry().contains(public_port).await);
    let _ = broker.shutdown.send(true);
}

#[tokio::test]
async fn tcp_transport_round_trip_through_public_port() {
    let (echo_port, _echo) = start_echo().await;
    let public_port = free_tcp_port();

    let broker = start_broker("Aulang", "tcp", 1023, 65535);
    let (_client_shutdown, _client) = start_client(
        "Aulang",
        "tcp",
        broker.control_port,
        NetAddress::new("127.0.0.1", echo_port, public_port),
        2,
    );

    let mut conn = connect_public(public_port).await;
    round_trip(&mut conn, b"over yamux this time").await;
    drop(conn);

    assert!(broker.server.registry().contains(public_port).await);
    let _ = broker.shutdown.send(true);
}

#[tokio::test]
async fn wrong_key_is_fatal_for_the_client() {
    let (echo_port, _echo) = start_echo().await;
    let public_port = free_tcp_port();

    let broker = start_broker("Aulang", "quic", 1023, 65535);
    let (_client_shutdown, client) = start_client(
        "Wrong",
        "quic",
        broker.control_port,
        NetAddress::new("127.0.0.1", echo_port, public_port),
        2,
    );

    let err = tokio::time::timeout(Duration::from_secs(20), client)
        .await
        .expect("client exits promptly")
        .expect("client task join")
        .expect_err("client must exit on auth failure");
    assert!(err.to_string().contains("authentication"));

    // Nothing was registered, so the public port never opened.
    assert!(!broker.server.registry().contains(public_port).await);
    assert!(TcpStream::connect(("127.0.0.1", public_port)).await.is_err());
    let _ = broker.shutdown.send(true);
}

#[tokio::test]
async fn out_of_range_port_is_fatal_for_the_client() {
    let (echo_port, _echo) = start_echo().await;

    let broker = start_broker("Aulang", "quic", 10000, 20000);
    let (_client_shutdown, client) = start_client(
        "Aulang",
        "quic",
        broker.control_port,
        NetAddress::new("127.0.0.1", echo_port, 9999),
        1,
    );

    let err = tokio::time::timeout(Duration::from_secs(20), client)
        .await
        .expect("client exits promptly")
        .expect("client task join")
        .expect_err("client must exit on port rejection");
    assert!(err.to_string().contains("9999"));
    let _ = broker.shutdown.send(true);
}

#[tokio::test]
async fn single_tunnel_pool_replenishes_between_connections() {
    let (echo_port, _echo) = start_echo().await;
    let public_port = free_tcp_port();

    let broker = start_broker("Aulang", "quic", 1023, 65535);
    let (_client_shutdown, _client) = start_client(
        "Aulang",
        "quic",
        broker.control_port,
        NetAddress::new("127.0.0.1", echo_port, public_port),
        1,
    );

    // Each connection consumes the pool's only tunnel; the next one relies
    // on the client's replacement dial.
    for i in 0..3u8 {
        let mut conn = connect_public(public_port).await;
        round_trip(&mut conn, format!("round {i}").as_bytes()).await;
        drop(conn);
    }

    let _ = broker.shutdown.send(true);
}
