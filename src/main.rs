// rootlockd: run the lock coordinator election for a storage root and hold
// the elected role until interrupted. Useful for pinning the coordinator to
// a dedicated process instead of whichever peer starts first.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use rootlock::{ElectionConfig, ElectionController, DEFAULT_BASE_PORT};

#[derive(Parser)]
#[command(name = "rootlockd", version, about = "Folder lock coordinator daemon")]
struct Cli {
    /// Storage root to coordinate
    root: PathBuf,

    /// Serve the coordinator on this address; omit for exclusive mode
    #[arg(long)]
    host: Option<String>,

    /// First port of the bind window
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    base_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = ElectionConfig {
        host: cli.host,
        base_port: cli.base_port,
        ..ElectionConfig::default()
    };
    let controller = ElectionController::start(cli.root, config).await?;
    info!("running as {:?}; press ctrl-c to stop", controller.role());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
