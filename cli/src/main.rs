// blecentral: desktop CLI for the BLE central core
//
// Cross-platform (macOS, Linux, Windows) command-line access to a BLE
// adapter through btleplug.

mod config;
mod transport;

use anyhow::{Context, Result};
use blecentral_core::{
    response_channel, BleCentral, CharacteristicRecord, Delivery, DeviceRecord, ResponseStream,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use transport::BtleTransport;

#[derive(Parser)]
#[command(name = "blecentral")]
#[command(about = "BLE central: scan, connect, read, write and monitor", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for advertising devices
    Scan {
        /// Only report devices advertising these services
        #[arg(short, long)]
        service: Vec<String>,
        /// Seconds to scan (defaults to the configured scan timeout)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Show adapter state
    State,
    /// List a device's services
    Services { address: String },
    /// List the characteristics of one service
    Characteristics { address: String, service: String },
    /// Read a characteristic
    Read {
        address: String,
        service: String,
        characteristic: String,
    },
    /// Write a base64-encoded value to a characteristic
    Write {
        address: String,
        service: String,
        characteristic: String,
        value: String,
        #[arg(long)]
        no_response: bool,
    },
    /// Print notifications until Ctrl-C or `--count` values
    Monitor {
        address: String,
        service: String,
        characteristic: String,
        #[arg(short, long)]
        count: Option<usize>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    match cli.command {
        Commands::Config { action } => cmd_config(config, action),
        command => {
            let session = Session::open(config).await?;
            let result = session.run(command).await;
            session.close().await;
            result
        }
    }
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn new_transaction_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn print_device(record: &DeviceRecord) {
    let name = record.name.as_deref().unwrap_or("(unnamed)");
    let rssi = record
        .rssi
        .map(|rssi| format!("{} dBm", rssi))
        .unwrap_or_else(|| "-".to_string());
    println!("  {} {:<20} {:<24} {}", "•".bright_green(), record.uuid.bright_cyan(), name, rssi.dimmed());
}

fn print_value(record: &CharacteristicRecord) {
    let bytes = record.value_bytes().unwrap_or_default();
    println!(
        "  {} {} {}",
        record.uuid.to_string().bright_cyan(),
        hex::encode(&bytes).bright_yellow(),
        format!("({})", record.value.as_deref().unwrap_or("")).dimmed()
    );
}

struct Session {
    central: BleCentral,
    transport: Arc<BtleTransport>,
    config: config::Config,
}

impl Session {
    async fn open(config: config::Config) -> Result<Self> {
        let transport = BtleTransport::open(config.adapter_index)
            .await
            .context("Failed to open Bluetooth adapter")?;
        let central = BleCentral::new(transport.clone(), config.central());
        transport.watch_events(central.clone());
        Ok(Self {
            central,
            transport,
            config,
        })
    }

    /// Tear down the central and give open links a bounded time to close.
    async fn close(&self) {
        let grace = Duration::from_secs(self.config.connect_timeout_secs);
        if tokio::time::timeout(grace, self.central.shutdown_and_wait()).await.is_err() {
            tracing::warn!("Timed out closing links on exit");
        }
    }

    async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Scan { service, timeout } => self.scan(service, timeout).await,
            Commands::State => {
                let (sink, mut stream) = response_channel();
                self.central.state(sink);
                println!("Adapter: {}", stream.result().await?.to_string().bright_cyan());
                Ok(())
            }
            Commands::Services { address } => self.services(&address).await,
            Commands::Characteristics { address, service } => self.characteristics(&address, &service).await,
            Commands::Read {
                address,
                service,
                characteristic,
            } => {
                self.connect(&address).await?;
                let (sink, mut stream) = response_channel();
                self.central
                    .read_characteristic(&address, &service, &characteristic, &new_transaction_id(), sink);
                print_value(&stream.result().await?);
                Ok(())
            }
            Commands::Write {
                address,
                service,
                characteristic,
                value,
                no_response,
            } => {
                self.connect(&address).await?;
                let (sink, mut stream) = response_channel();
                self.central.write_characteristic(
                    &address,
                    &service,
                    &characteristic,
                    &value,
                    !no_response,
                    &new_transaction_id(),
                    sink,
                );
                let record = stream.result().await?;
                println!("{} Wrote {}", "✓".green(), hex::encode(record.value_bytes().unwrap_or_default()));
                Ok(())
            }
            Commands::Monitor {
                address,
                service,
                characteristic,
                count,
            } => self.monitor(&address, &service, &characteristic, count).await,
            Commands::Config { action } => cmd_config(self.config.clone(), action),
        }
    }

    async fn scan(&self, services: Vec<String>, timeout: Option<u64>) -> Result<()> {
        let filter = (!services.is_empty()).then_some(services);
        let duration = Duration::from_secs(timeout.unwrap_or(self.config.scan_timeout_secs));

        let (sink, mut stream) = response_channel();
        self.central.start_device_scan(filter, sink);
        println!("{} ({}s)", "Scanning".bold(), duration.as_secs());

        let mut seen = HashSet::new();
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = tokio::signal::ctrl_c() => break,
                delivery = stream.next() => match delivery {
                    Some(Delivery::Value(record)) => {
                        if seen.insert(record.uuid.clone()) {
                            print_device(&record);
                        }
                    }
                    Some(Delivery::Error(err)) => return Err(err.into()),
                    Some(Delivery::Done) | None => break,
                },
            }
        }

        let (sink, mut stopped) = response_channel();
        self.central.stop_scan(sink);
        stopped.result().await?;
        println!();
        println!("{} device(s) found", seen.len());
        Ok(())
    }

    /// Find and connect to `address`, giving up after the configured
    /// connect timeout.
    async fn connect(&self, address: &str) -> Result<()> {
        let scan_timeout = Duration::from_secs(self.config.scan_timeout_secs);
        if !self.transport.discover(address, scan_timeout).await? {
            anyhow::bail!("Device {} not found", address);
        }

        let (sink, mut stream) = response_channel();
        self.central.connect_to_device(address, sink);
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        match tokio::time::timeout(connect_timeout, stream.result()).await {
            Ok(record) => {
                let record = record?;
                tracing::info!("Connected to {}", record.uuid);
                Ok(())
            }
            Err(_) => {
                let (sink, _) = response_channel();
                self.central.disconnect_device(address, sink);
                anyhow::bail!("Timed out connecting to {}", address)
            }
        }
    }

    async fn services(&self, address: &str) -> Result<()> {
        self.connect(address).await?;
        let (sink, mut stream) = response_channel();
        self.central.discover_services(address, sink);
        let services = stream.result().await?;

        println!("{} ({} total)", "Services".bold(), services.len());
        for service in services {
            let kind = if service.is_primary { "primary" } else { "secondary" };
            println!("  {} {} {}", "•".bright_green(), service.uuid.to_string().bright_cyan(), kind.dimmed());
        }
        Ok(())
    }

    async fn characteristics(&self, address: &str, service: &str) -> Result<()> {
        self.connect(address).await?;
        let (sink, mut stream) = response_channel();
        self.central.discover_characteristics(address, service, sink);
        let characteristics = stream.result().await?;

        println!("{} ({} total)", "Characteristics".bold(), characteristics.len());
        for characteristic in characteristics {
            let mut flags = Vec::new();
            if characteristic.is_readable {
                flags.push("read");
            }
            if characteristic.is_writable_with_response {
                flags.push("write");
            }
            if characteristic.is_writable_without_response {
                flags.push("write-no-response");
            }
            if characteristic.is_notifiable {
                flags.push("notify");
            }
            if characteristic.is_indicatable {
                flags.push("indicate");
            }
            println!(
                "  {} {} {}",
                "•".bright_green(),
                characteristic.uuid.to_string().bright_cyan(),
                flags.join(", ").dimmed()
            );
        }
        Ok(())
    }

    async fn monitor(&self, address: &str, service: &str, characteristic: &str, count: Option<usize>) -> Result<()> {
        self.connect(address).await?;
        let transaction_id = new_transaction_id();
        let (sink, mut stream) = response_channel();
        self.central
            .monitor_characteristic(address, service, characteristic, &transaction_id, sink);
        println!("{} {} (Ctrl-C to stop)", "Monitoring".bold(), characteristic.bright_cyan());

        let received = tokio::select! {
            received = print_notifications(&mut stream, count) => received?,
            _ = tokio::signal::ctrl_c() => 0,
        };

        let (sink, mut cancelled) = response_channel();
        self.central.cancel_transaction(&transaction_id, sink);
        cancelled.result().await?;
        println!();
        println!("{} value(s) received", received);
        Ok(())
    }
}

async fn print_notifications(stream: &mut ResponseStream<CharacteristicRecord>, limit: Option<usize>) -> Result<usize> {
    let mut received = 0;
    while limit.map_or(true, |limit| received < limit) {
        match stream.next().await {
            Some(Delivery::Value(record)) => {
                print_value(&record);
                received += 1;
            }
            Some(Delivery::Error(err)) => return Err(err.into()),
            Some(Delivery::Done) | None => break,
        }
    }
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_write() {
        let cli = Cli::try_parse_from(["blecentral", "write", "AA:BB", "180D", "2A37", "/w==", "--no-response"]).unwrap();
        match cli.command {
            Commands::Write { value, no_response, .. } => {
                assert_eq!(value, "/w==");
                assert!(no_response);
            }
            _ => panic!("expected write"),
        }
    }
}
