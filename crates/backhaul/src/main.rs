use backhaul::Mode;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "backhaul",
    version,
    about = "Reverse-tunnel port broker: expose private TCP services through a public QUIC broker"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the public broker; with no arguments, loads config.yml
    Server {
        /// KEY PORT MIN-MAX (e.g. Aulang 8888 10000-20000)
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Start the tunnel client; with no arguments, loads config.yml
    Client {
        /// KEY SERVER:PORT LOCAL:PORT:PUBLIC[,...] [TUNNEL_COUNT]
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Print a client credential derived from the server key
    Generate {
        /// The server's configured key
        seed: String,
        /// Optional expiry date, YYYY-MM-DD
        expiry: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mode = match cli.command {
        Command::Server { args } => Mode::Server { args },
        Command::Client { args } => Mode::Client { args },
        Command::Generate { seed, expiry } => Mode::Generate { seed, expiry },
    };
    backhaul::run(mode).await
}
