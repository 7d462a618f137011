//! Operator CLI for a fleetsync peer

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleetsync::common::{parse_duration, Config, FileStore, StaticRole};
use fleetsync::coordinator::{DownloadRequest, StorageCoordinator, UpgradeCoordinator, UpgradeOptions};
use fleetsync::ops::{HttpDownloader, SystemdServiceManager};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fleetsync")]
#[command(about = "Leader/follower binary distribution over a shared volume")]
#[command(version)]
struct Cli {
    /// Config file (TOML); FLEETSYNC__* environment variables override it
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Unit name of this peer (overrides config)
    #[arg(long)]
    unit: Option<String>,

    /// Shared volume root (overrides config)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Act as the leader
    #[arg(long)]
    leader: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show volume, lock, download and upgrade state
    Status,

    /// Print the filesystem id of the shared volume
    MountId,

    /// Check that the installed binaries are a complete install of VERSION
    Verify { version: String },

    /// Wait for VERSION to be installed by the leader (followers)
    Wait {
        version: String,

        /// Give up after this long (0 waits forever)
        #[arg(long, default_value = "0s", value_parser = duration_arg)]
        timeout: Duration,

        /// Poll interval
        #[arg(long, default_value = "5s", value_parser = duration_arg)]
        interval: Duration,
    },

    /// Download and install VERSION (leader)
    Install {
        version: String,

        /// Release archive URL (.tar.gz)
        #[arg(long)]
        url: String,

        /// SHA-256 checksum file URL
        #[arg(long)]
        checksum_url: Option<String>,

        /// How long to wait for the download lock
        #[arg(long, default_value = "60s", value_parser = duration_arg)]
        lock_timeout: Duration,
    },

    /// Run a full rolling upgrade to VERSION (leader)
    Upgrade {
        version: String,

        #[arg(long)]
        url: String,

        #[arg(long)]
        checksum_url: Option<String>,
    },

    /// React to the leader's upgrade phase (followers)
    Observe {
        /// Keep polling instead of a single pass
        #[arg(long)]
        follow: bool,
    },

    /// Create the private worker directory of a unit
    WorkerDir {
        /// Unit name (defaults to this peer)
        unit: Option<String>,
    },
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match (&cli.unit, &cli.root, &cli.config) {
        (Some(unit), Some(root), None) => Config::new(unit.clone(), root.clone()),
        _ => Config::load(cli.config.as_deref()).context("failed to load configuration")?,
    };
    if let Some(unit) = &cli.unit {
        config.unit_name = unit.clone();
    }
    if let Some(root) = &cli.root {
        config.volume.root = root.clone();
    }
    if cli.leader {
        config.leader = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let role = Arc::new(StaticRole::new(config.leader));
    let downloader = Arc::new(HttpDownloader::new(Duration::from_secs(3600))?);
    let storage = Arc::new(StorageCoordinator::from_config(
        &config,
        role.clone(),
        downloader,
    )?);

    // participants register themselves; status only looks
    let upgrade_coordinator = |register: bool| -> anyhow::Result<UpgradeCoordinator> {
        let relation = storage.volume().relation_directory();
        let store = if register {
            FileStore::open(relation, config.unit_name.clone(), role.clone())?
        } else {
            FileStore::attach(relation, config.unit_name.clone(), role.clone())
        };
        Ok(UpgradeCoordinator::from_config(
            &config,
            storage.clone(),
            Arc::new(store),
            Arc::new(SystemdServiceManager::new()),
        ))
    };

    match cli.command {
        Commands::Status => {
            let volume = storage.volume();
            let role_name = if storage.is_leader() { "leader" } else { "follower" };
            println!("Peer: {} ({})", storage.identity(), role_name);
            println!("Volume: {}", volume.root().display());
            println!("  Filesystem id: {}", volume.filesystem_id());
            println!("  Writable: {}", volume.is_writable());
            println!(
                "  Installed version: {}",
                storage.get_installed_version()?.as_deref().unwrap_or("none")
            );
            println!("  Download: {}", storage.download_status()?);
            match storage.lock_coordinator().inspect()? {
                Some(lock) => println!(
                    "  Lock: held by {} since {} (token {})",
                    lock.holder_id, lock.acquired_at, lock.fencing_token
                ),
                None => println!("  Lock: free"),
            }

            let state = upgrade_coordinator(false)?.get_upgrade_state()?;
            println!("Upgrade: {}", state.phase);
            if let Some(target) = &state.target_version {
                println!("  Target: {}", target);
                println!(
                    "  Workers ready: {}/{}",
                    state.worker_ready_count, state.expected_worker_count
                );
            }
        }

        Commands::MountId => {
            println!("{}", storage.volume().filesystem_id());
        }

        Commands::Verify { version } => match storage.verification_failure(&version)? {
            None => println!("{} OK", version),
            Some(reason) => anyhow::bail!("{} is not valid: {}", version, reason),
        },

        Commands::Wait {
            version,
            timeout,
            interval,
        } => {
            if !storage.wait_for_binaries(&version, timeout, interval).await? {
                anyhow::bail!("timed out waiting on {}", version);
            }
            println!("{} available", version);
        }

        Commands::Install {
            version,
            url,
            checksum_url,
            lock_timeout,
        } => {
            let mut request = DownloadRequest::new(version, url);
            request.checksum_url = checksum_url;
            let result = storage
                .install_binaries(&request, lock_timeout)
                .await?
                .into_result()?;
            println!(
                "Installed {} into {} in {:.1}s",
                result.version,
                result.installed_path.display(),
                result.duration_seconds
            );
        }

        Commands::Upgrade {
            version,
            url,
            checksum_url,
        } => {
            let mut request = DownloadRequest::new(version, url);
            request.checksum_url = checksum_url;
            let options = UpgradeOptions::from(&config.upgrade);
            let result = upgrade_coordinator(true)?.run_upgrade(&request, &options).await?;
            println!("Upgraded fleet to {}", result.version);
        }

        Commands::Observe { follow } => {
            let coordinator = upgrade_coordinator(true)?;
            let interval = config.poll.retry_policy().interval();
            loop {
                match coordinator.observe().await {
                    Ok(Some(phase)) => println!("Handled phase {}", phase),
                    Ok(None) => {}
                    Err(e) if follow && !e.is_configuration() => {
                        tracing::error!("Observation failed: {}", e)
                    }
                    Err(e) => return Err(e.into()),
                }
                if !follow {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }

        Commands::WorkerDir { unit } => {
            let unit = unit.unwrap_or_else(|| config.unit_name.clone());
            let dir = storage.create_worker_directory(&unit)?;
            println!("{}", dir.display());
        }
    }

    Ok(())
}
