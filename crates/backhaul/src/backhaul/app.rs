use crate::backhaul::{
    config::{self, LoggingConfig},
    key, logging,
    tunnel::{
        client::{Client, ClientOptions},
        server::{Server, ServerOptions},
        transport::{QuicDialOptions, QuicListenOptions},
    },
};

/// What the CLI asked for. Empty `args` means "load config.yml".
#[derive(Debug)]
pub enum Mode {
    Server { args: Vec<String> },
    Client { args: Vec<String> },
    Generate { seed: String, expiry: Option<String> },
}

pub async fn run(mode: Mode) -> anyhow::Result<()> {
    match mode {
        Mode::Generate { seed, expiry } => {
            let credential = key::generate(&seed, expiry.as_deref())?;
            println!("{credential}");
            Ok(())
        }
        Mode::Server { args } => run_server(args).await,
        Mode::Client { args } => run_client(args).await,
    }
}

async fn run_server(args: Vec<String>) -> anyhow::Result<()> {
    let (cfg, quic, logging_cfg) = if args.is_empty() {
        let settings = config::load_file_settings()?;
        let (cert_file, key_file) = settings.server_cert_files();
        (
            settings.server_config()?,
            QuicListenOptions {
                cert_file,
                key_file,
            },
            settings.logging.clone(),
        )
    } else {
        (
            config::server_config_from_args(&args)?,
            QuicListenOptions::default(),
            LoggingConfig::default(),
        )
    };

    let _logging = logging::init(&logging_cfg)?;
    tracing::info!(
        control_port = cfg.port,
        proxy_ports = %format!("{}-{}", cfg.min_proxy_port, cfg.max_proxy_port),
        "backhaul: server starting"
    );

    let server = Server::new(ServerOptions {
        config: cfg,
        transport: "quic".into(),
        quic,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("backhaul: shutdown signal");
            let _ = shutdown_tx.send(true);
            Ok(())
        }
        res = server.listen_and_serve(shutdown_rx) => res,
    }
}

async fn run_client(args: Vec<String>) -> anyhow::Result<()> {
    let (cfg, logging_cfg) = if args.is_empty() {
        let settings = config::load_file_settings()?;
        (settings.client_config()?, settings.logging.clone())
    } else {
        (
            config::client_config_from_args(&args)?,
            LoggingConfig::default(),
        )
    };

    let _logging = logging::init(&logging_cfg)?;
    tracing::info!(
        server = %cfg.server_addr.addr(),
        mappings = cfg.proxy_addrs.len(),
        tunnels = cfg.tunnel_count,
        "backhaul: client starting"
    );

    let server_name = cfg.server_addr.host.clone();
    let client = Client::new(ClientOptions {
        config: cfg,
        transport: "quic".into(),
        quic: QuicDialOptions {
            server_name,
            insecure_skip_verify: true,
        },
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("backhaul: shutdown signal");
            let _ = shutdown_tx.send(true);
            Ok(())
        }
        res = client.run(shutdown_rx) => res,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
