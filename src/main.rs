use anyhow::Result;
use clap::Parser;

use devnet_builder::cli::commands::UpgradeCommand;
use devnet_builder::cli::{Cli, Commands};
use devnet_builder::{config, init_telemetry};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config()?;
    init_telemetry(&config.observability)?;

    let home = cli.home.clone().unwrap_or_else(|| config.devnet.home.clone());

    let success = match cli.command {
        Commands::Upgrade { action } => {
            tokio::runtime::Runtime::new()?.block_on(async {
                UpgradeCommand::new(action, home)
                    .with_json(cli.json)
                    .execute(config)
                    .await
            })?
        }
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}
