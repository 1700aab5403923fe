mod config;
mod error;
mod host;
mod protocol;
mod remote;
mod sensor;
mod store;
mod transport;

#[cfg(test)]
mod testing;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{device_uid, send_delay_from_secs, Config, ConfigFile};
use crate::host::{ArpTableResolver, LogNotifier};
use crate::remote::{Remote, RemoteSettings, StoredCode};
use crate::sensor::{Fetcher, SensorKind};
use crate::store::JsonFileStore;

const CODES_KEY: &str = "wfirex4_codes";

#[derive(Parser)]
#[command(name = "wfirex4")]
#[command(about = "Client for the RS-WFIREX4 IR blaster and environment sensor")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send learned commands or raw codes
    Send {
        /// Device the commands were learned for
        #[arg(short, long)]
        device: Option<String>,
        /// How many times to send the whole list
        #[arg(short = 'n', long, default_value_t = 1)]
        repeats: u32,
        /// Seconds between sends (defaults to remote.delay_secs)
        #[arg(long)]
        delay: Option<f64>,
        /// Command names, 32+ digit hex codes or b64:<code>
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Learn commands from a physical remote
    Learn {
        #[arg(short, long)]
        device: String,
        /// Learn each command twice as an alternating pair
        #[arg(long)]
        toggle: bool,
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// List learned codes and toggle state
    Codes {
        /// Only this device
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Read the sensors once
    Sensor {
        /// Print the reading as JSON
        #[arg(long)]
        json: bool,
    },
    /// Read the sensors every scan interval until Ctrl+C
    Poll,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        eprintln!("Warning: config file {:?} not found", cli.config);
        eprintln!("Using default configuration");
        Config::default()
    };

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!(
        "wfirex4 v{}: {} at {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.device.name,
        config.device.host,
        config.device.port
    );

    match cli.command {
        Command::Send {
            device,
            repeats,
            delay,
            commands,
        } => {
            let mut remote = open_remote(&config).await?;
            let delay = match delay {
                Some(secs) => send_delay_from_secs(secs).context("--delay")?,
                None => config.send_delay()?,
            };
            let result = remote
                .send_command(&commands, device.as_deref(), repeats, delay)
                .await;
            remote.flush().await.context("failed to save toggle flags")?;

            let sent = result?;
            info!("Sent {} code(s)", sent);
            if let Some(reply) = &remote.attributes().last_command_result {
                println!("{}", reply);
            }
        }
        Command::Learn {
            device,
            toggle,
            commands,
        } => {
            let mut remote = open_remote(&config).await?;
            let learned = remote.learn_commands(&commands, &device, toggle).await?;
            info!("Learned {} of {} command(s) for {}", learned, commands.len(), device);
            if learned < commands.len() {
                anyhow::bail!("{} command(s) were not learned", commands.len() - learned);
            }
        }
        Command::Codes { device } => {
            let remote = open_remote(&config).await?;
            println!(
                "{} ({})",
                config.device.name,
                if remote.is_on() { "on" } else { "off" }
            );

            let mut devices: Vec<_> = remote
                .codes()
                .iter()
                .filter(|(name, _)| device.as_deref().map_or(true, |d| d == name.as_str()))
                .collect();
            devices.sort_by(|a, b| a.0.cmp(b.0));
            for (name, commands) in devices {
                let next = remote.flags().get(name).copied().unwrap_or(0) & 1;
                println!("{}:", name);
                let mut commands: Vec<_> = commands.iter().collect();
                commands.sort_by(|a, b| a.0.cmp(b.0));
                for (command, code) in commands {
                    match code {
                        StoredCode::Single(hex) => println!("  {:<16} {}", command, hex),
                        StoredCode::Toggle(pair) => {
                            println!("  {:<16} toggle, next {}", command, pair[next as usize])
                        }
                    }
                }
            }
        }
        Command::Sensor { json } => {
            let fetcher = open_fetcher(&config, &cli.config).await;
            let reading = fetcher
                .fetch()
                .await?
                .context("no reading available")?;
            let host = fetcher.host().await;
            if host != config.device.host {
                info!("Device answered from its new address {}", host);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&reading)?);
            } else {
                for kind in SensorKind::ALL {
                    println!("{:<12} {} {}", kind, reading.value(kind), kind.unit());
                }
            }
        }
        Command::Poll => {
            let fetcher = open_fetcher(&config, &cli.config).await;
            info!("Polling every {:?}. Press Ctrl+C to stop.", fetcher.scan_interval());
            tokio::select! {
                _ = run_poller(&fetcher) => {}
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Shutting down...");
                }
            }
        }
    }

    Ok(())
}

async fn open_remote(config: &Config) -> anyhow::Result<Remote> {
    let uid = device_uid(
        &config.device,
        ArpTableResolver::default()
            .lookup_mac(&config.device.host)
            .await,
    );
    let flags_key = format!("wfirex4_{}_flags", uid.replace(':', ""));

    let code_store = JsonFileStore::new(&config.storage.dir, CODES_KEY);
    let flag_store = JsonFileStore::new(&config.storage.dir, &flags_key);
    debug!(
        "Storage: codes {:?}, flags {:?}",
        code_store.path(),
        flag_store.path()
    );

    let mut remote = Remote::new(
        RemoteSettings::from_config(config),
        Arc::new(code_store),
        Arc::new(flag_store),
        Arc::new(LogNotifier),
    );
    if !config.remote.enabled {
        remote.set_on(false);
    }
    remote
        .load_storage()
        .await
        .with_context(|| format!("failed to load storage from {:?}", config.storage.dir))?;
    Ok(remote)
}

/// The fetcher follows the device by MAC, so fill it in from the ARP table
/// when the config leaves it empty
async fn open_fetcher(config: &Config, config_path: &Path) -> Fetcher {
    let arp = ArpTableResolver::default();
    let mut config = config.clone();
    config.device.mac = device_uid(&config.device, arp.lookup_mac(&config.device.host).await);

    Fetcher::from_config(
        &config,
        Arc::new(arp),
        Arc::new(ConfigFile::new(config_path)),
    )
}

/// Fetch on every scan interval; after a failure wait 30-60 s instead
async fn run_poller(fetcher: &Fetcher) {
    loop {
        let wait = match fetcher.fetch().await {
            Ok(Some(reading)) => {
                info!(
                    "temperature={:.1}{} humidity={}{} light={}{} reliability={}{}",
                    reading.temperature,
                    SensorKind::Temperature.unit(),
                    reading.humidity,
                    SensorKind::Humidity.unit(),
                    reading.light,
                    SensorKind::Light.unit(),
                    reading.reliability,
                    SensorKind::Reliability.unit()
                );
                fetcher.scan_interval()
            }
            Ok(None) => {
                warn!("No sensor reading yet");
                fetcher.scan_interval()
            }
            Err(e) => {
                let secs = rand::thread_rng().gen_range(30..=60);
                error!("{}; retrying in {} s", e, secs);
                if let Some(last) = fetcher.last_reading().await {
                    warn!("Last good reading is from {}", last.fetched_at);
                }
                Duration::from_secs(secs)
            }
        };
        tokio::time::sleep(wait).await;
    }
}
