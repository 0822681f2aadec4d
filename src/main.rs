use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "netward",
    version,
    about = "Network edge control plane: supervised port forwarding, STUN probing, DDNS"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Persistence root directory
    #[arg(long, global = true, default_value = "data")]
    data: PathBuf,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start all enabled workers (default when no subcommand given)
    Run,

    /// Validate the rule store and print a summary
    Check,

    /// Send a Wake-on-LAN magic packet
    Wake {
        /// Target MAC address, e.g. AA:BB:CC:DD:EE:FF
        #[arg(long)]
        mac: String,
        /// Broadcast address
        #[arg(long, default_value = netward::common::wol::DEFAULT_BROADCAST)]
        broadcast: String,
        /// UDP port
        #[arg(long, default_value_t = netward::common::wol::DEFAULT_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command {
        Some(Commands::Check) => cmd_check(&cli.data).await,
        Some(Commands::Wake {
            mac,
            broadcast,
            port,
        }) => {
            netward::common::wol::wake(&mac, &broadcast, port).await?;
            println!("magic packet sent to {} via {}:{}", mac, broadcast, port);
            Ok(())
        }
        Some(Commands::Run) | None => cmd_run(&cli.data).await,
    }
}

async fn cmd_run(data_dir: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    info!(data = %data_dir.display(), "netward starting");
    let app = netward::app::App::new(data_dir)?;
    app.run().await
}

async fn cmd_check(data_dir: &std::path::Path) -> Result<()> {
    match netward::store::FileStore::open(data_dir) {
        Ok(store) => {
            let summary = store.summary().await;
            println!("rule store under '{}' is valid", data_dir.display());
            println!("  port forwards:  {}", summary.port_forwards);
            println!("  stun rules:     {}", summary.stun_rules);
            println!("  ddns tasks:     {}", summary.ddns_tasks);
            println!("  callback tasks: {}", summary.callback_tasks);
            println!("  history rows:   {}", summary.histories);
            Ok(())
        }
        Err(e) => {
            eprintln!("rule store under '{}' has errors:", data_dir.display());
            eprintln!("  {:#}", e);
            std::process::exit(1);
        }
    }
}
