use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rangelease::{Config, Engine, Result};

#[derive(Parser)]
#[command(name = "rangelease")]
#[command(author, version, about = "DHCPv4 lease-management engine", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    ListLeases,
    CleanupLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting lease engine with config: {:?}", cli.config);
            let engine = Engine::from_config(&config)?;
            engine.start_gc(config.gc_period()).await;

            info!(
                "Managing {} - {} ({} addresses), lease time {}",
                config.range_start,
                config.range_end,
                config.range_size(),
                config.lease_time
            );

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal, stopping engine...");
            if let Err(error) = engine.shutdown().await {
                tracing::error!("Failed to flush leases on shutdown: {}", error);
            }
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let engine = Engine::from_config(&config)?;
            let leases = engine.find_all().await?;

            if leases.is_empty() {
                println!("No active leases.");
            } else {
                let now = Utc::now();
                println!(
                    "{:<20} {:<16} {:<26} {:<10}",
                    "Hardware Address", "IP Address", "Expires At", "Remaining"
                );
                println!("{}", "-".repeat(74));

                for lease in leases {
                    let remaining = lease.remaining_seconds(now);
                    let remaining_str = if remaining > 0 {
                        format!("{}s", remaining)
                    } else {
                        "expired".to_string()
                    };

                    println!(
                        "{:<20} {:<16} {:<26} {:<10}",
                        lease.hw.to_string(),
                        lease.ip.to_string(),
                        lease.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        remaining_str
                    );
                }
            }

            Ok(())
        }
        Commands::CleanupLeases => {
            let engine = Engine::from_config(&config)?;
            let count = engine.collect_expired(Utc::now()).await?;
            println!("Cleaned up {} expired lease(s).", count);
            Ok(())
        }
    }
}
