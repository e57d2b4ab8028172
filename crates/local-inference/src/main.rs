#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use futures_util::StreamExt;
#[cfg(feature = "cli")]
use local_inference::{
    config::Config, progress_channel, telemetry, HardwareProfile, HardwareTier, LifecycleManager,
    OperationOptions,
};
#[cfg(feature = "cli")]
use tracing::{info, warn};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "local-inference", version, about = "Manage models for the local inference service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// List catalog aliases and their variants
    Catalog,
    /// Download the best variant of an alias into the cache
    Download { alias: String },
    /// Download, load and serve an alias until Ctrl-C
    Run {
        alias: String,
        #[arg(long)]
        hardware: Option<HardwareTier>,
    },
    /// Remove a variant from the cache
    Evict { variant_id: String },
    /// Show the detected hardware profile
    Hardware,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let cfg = Config::from_env()?;
    cfg.print_config();

    run(cli.command, cfg).await
}

#[cfg(feature = "cli")]
async fn run(command: Command, cfg: Config) -> anyhow::Result<()> {
    match command {
        // Needs no catalog, so skip the manager and its config validation.
        Command::Hardware => {
            let profile = match cfg.hardware {
                Some(tier) => HardwareProfile::for_tier(tier),
                None => tokio::task::spawn_blocking(HardwareProfile::detect).await?,
            };
            print_hardware(&profile)
        }
        command => run_with_manager(command, LifecycleManager::new(cfg).await?).await,
    }
}

#[cfg(feature = "cli")]
fn print_hardware(profile: &HardwareProfile) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(profile)?);
    Ok(())
}

#[cfg(feature = "cli")]
async fn run_with_manager(command: Command, manager: LifecycleManager) -> anyhow::Result<()> {
    match command {
        Command::Catalog => {
            let snapshot = manager.refresh_catalog().await?;
            if snapshot.stale {
                warn!("Catalog source unreachable; showing the last known catalog");
            }
            for alias in snapshot.aliases() {
                println!("{}", alias);
                for variant in snapshot.find_variants(alias) {
                    let cached = if manager.is_cached(&variant.id) { " (cached)" } else { "" };
                    println!(
                        "  {:<40} {:<8} {:>12} bytes{}",
                        variant.id,
                        variant.hardware,
                        variant.total_size(),
                        cached
                    );
                }
            }
        }
        Command::Download { alias } => {
            let (reporter, mut progress) = progress_channel();
            let printer = tokio::spawn(async move {
                while let Some(update) = progress.next().await {
                    if update.bytes_total > 0 {
                        eprint!(
                            "\r{:>5.1}% ({}/{} bytes)",
                            update.bytes_downloaded as f64 * 100.0 / update.bytes_total as f64,
                            update.bytes_downloaded,
                            update.bytes_total
                        );
                    }
                }
                eprintln!();
            });
            let entry = manager
                .download_with(&alias, OperationOptions::default(), Some(reporter))
                .await;
            let _ = printer.await;
            let entry = entry?;
            println!("{} cached at {}", entry.variant_id, entry.path.display());
        }
        Command::Run { alias, hardware } => {
            let handle = manager.init(&alias, hardware).await?;
            if let Some(endpoint) = manager.endpoint() {
                println!("model:    {}", handle.variant_id);
                println!("endpoint: {}/v1", endpoint.base_url());
                if let Some(key) = manager.api_key() {
                    println!("api key:  {}", key);
                }
            }
            info!("Serving {}; press Ctrl-C to stop", handle.variant_id);
            tokio::signal::ctrl_c().await?;
            manager.shutdown().await?;
        }
        Command::Evict { variant_id } => {
            manager.evict(&variant_id).await?;
            println!("evicted {}", variant_id);
        }
        Command::Hardware => print_hardware(manager.hardware())?,
    }

    Ok(())
}


#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
