// blegate CLI - HTTP gateway for Bluetooth LE peripherals

mod api;
mod btle;
mod config;
mod server;

use anyhow::{Context, Result};
use blegate_core::{BleAdapter, Gateway, SimulatedAdapter};
use clap::{Parser, Subcommand};
use colored::*;
use config::AdapterKind;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "blegate")]
#[command(about = "Expose nearby BLE peripherals over HTTP", long_about = None)]
#[command(version)]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Serve {
        /// HTTP port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// BLE stack to use (overrides config)
        #[arg(short, long, value_enum)]
        adapter: Option<AdapterKind>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List peripherals seen by a running gateway
    Nodes {
        /// Only peripherals that accept connections
        #[arg(short, long)]
        connectable: bool,
    },

    /// Read a characteristic through a running gateway
    Read {
        node: String,
        service: String,
        item: String,
    },

    /// Write a characteristic through a running gateway
    Write {
        node: String,
        service: String,
        item: String,
        /// Hex bytes, `~text` or `.width.integer`
        value: String,

        /// Write without response
        #[arg(long)]
        no_ack: bool,
    },

    /// Show open connections of a running gateway
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set a configuration value
    Set { key: String, value: String },
    /// Get a configuration value
    Get { key: String },
    /// List all configuration
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let default_filter = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, adapter } => cmd_serve(config, port, adapter).await,
        Commands::Config { action } => cmd_config(config, action),
        Commands::Nodes { connectable } => cmd_nodes(&config, connectable).await,
        Commands::Read {
            node,
            service,
            item,
        } => cmd_read(&config, &node, &service, &item).await,
        Commands::Write {
            node,
            service,
            item,
            value,
            no_ack,
        } => cmd_write(&config, &node, &service, &item, &value, no_ack).await,
        Commands::Status => cmd_status(&config).await,
    }
}

async fn cmd_serve(
    config: config::Config,
    port: Option<u16>,
    adapter: Option<AdapterKind>,
) -> Result<()> {
    let port = port.unwrap_or(config.port);
    let kind = adapter.unwrap_or(config.adapter);

    let adapter: Arc<dyn BleAdapter> = match kind {
        AdapterKind::Btleplug => Arc::new(
            btle::BtleplugAdapter::new()
                .await
                .context("Failed to open the Bluetooth adapter")?,
        ),
        AdapterKind::Simulated => Arc::new(SimulatedAdapter::with_demo_device()),
    };

    let gateway = Arc::new(Gateway::new(adapter, config.gateway_config()));
    let tasks = gateway.start().await;

    let ctx = Arc::new(server::WebContext {
        gateway,
        prefix: config::normalize_prefix(&config.prefix),
        test_dir: config.test_dir.as_ref().map(PathBuf::from),
    });

    println!("{}", "blegate".bold());
    println!("  Adapter: {}", kind.to_string().bright_cyan());
    println!(
        "  API:     {}",
        format!("http://0.0.0.0:{}{}/nodes", port, ctx.prefix).bright_green()
    );
    if let Some(dir) = &ctx.test_dir {
        println!("  Test:    {}", dir.display().to_string().dimmed());
    }
    println!();

    tokio::select! {
        _ = server::serve(ctx, port) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            println!();
            println!("{}", "Shutting down...".dimmed());
        }
    }

    tasks.abort();
    Ok(())
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
            } else if config.list().iter().any(|(k, _)| *k == key) {
                println!("{} = {}", key.bright_cyan(), "(none)".dimmed());
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }

            println!();
            println!(
                "  {}",
                config::Config::config_file()?.display().to_string().dimmed()
            );
        }
    }

    Ok(())
}

async fn connect_client(config: &config::Config) -> Result<api::GatewayClient> {
    let client = api::GatewayClient::new(config.port, &config.prefix);
    if !client.is_available().await {
        anyhow::bail!(
            "No gateway listening on port {}. Start one with: blegate serve",
            config.port
        );
    }
    Ok(client)
}

async fn cmd_nodes(config: &config::Config, connectable: bool) -> Result<()> {
    let client = connect_client(config).await?;
    let nodes = client.nodes(connectable).await?;

    if nodes.is_empty() {
        println!("{}", "No peripherals seen yet.".dimmed());
        return Ok(());
    }

    println!("{} ({} total)", "Peripherals".bold(), nodes.len());
    println!();

    for node in nodes {
        let name = node.local_name.clone().unwrap_or_else(|| "(unnamed)".to_string());
        println!("  {} {}", "•".bright_green(), name.bright_cyan());
        println!("    Address: {}", node.address);
        if let Some(rssi) = node.rssi {
            println!("    RSSI:    {} dBm", rssi);
        }
        if !node.connectable {
            println!("    {}", "not connectable".dimmed());
        }
    }

    Ok(())
}

async fn cmd_read(config: &config::Config, node: &str, service: &str, item: &str) -> Result<()> {
    let client = connect_client(config).await?;
    let value = client.read(node, service, item).await?;

    println!("  hex: {}", value.hex.bright_yellow());
    println!("  len: {}", value.len);
    if let Some(num) = value.num {
        println!("  num: {}", num);
    }
    if let Some(text) = &value.text {
        println!("  str: {}", text.bright_cyan());
    }

    Ok(())
}

async fn cmd_write(
    config: &config::Config,
    node: &str,
    service: &str,
    item: &str,
    value: &str,
    no_ack: bool,
) -> Result<()> {
    let client = connect_client(config).await?;
    client.write(node, service, item, value, no_ack).await?;
    println!("{} Wrote {} to {}", "✓".green(), value.bright_yellow(), item.bright_cyan());
    Ok(())
}

async fn cmd_status(config: &config::Config) -> Result<()> {
    let client = connect_client(config).await?;
    let connections = client.connections().await?;

    println!("{}", "Gateway Status".bold());
    println!("  Listening on port {}", config.port.to_string().bright_cyan());
    println!();

    if connections.is_empty() {
        println!("{}", "No connections.".dimmed());
        return Ok(());
    }

    for summary in connections {
        let marker = if summary.connected {
            "●".green()
        } else {
            "○".dimmed()
        };
        println!("  {} {}", marker, summary.address.bright_cyan());
        println!("    Last access:     {}", format_timestamp(summary.last_access));
        println!(
            "    Services:        {} ({} characteristics)",
            summary.services, summary.characteristics
        );
    }

    Ok(())
}

fn format_timestamp(millis: u64) -> String {
    if millis == 0 {
        return "not connected".to_string();
    }
    match chrono::DateTime::from_timestamp_millis(millis as i64) {
        Some(dt) => dt
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => millis.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve_overrides() {
        let cli = Cli::parse_from(["blegate", "serve", "--port", "8080", "--adapter", "simulated"]);
        match cli.command {
            Commands::Serve { port, adapter } => {
                assert_eq!(port, Some(8080));
                assert_eq!(adapter, Some(AdapterKind::Simulated));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_parse_write_flags() {
        let cli = Cli::parse_from([
            "blegate", "write", "c0:ab:2a:6a:1a:89", "180f", "2a19", ".1.5", "--no-ack",
        ]);
        match cli.command {
            Commands::Write { value, no_ack, .. } => {
                assert_eq!(value, ".1.5");
                assert!(no_ack);
            }
            _ => panic!("expected write"),
        }
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "not connected");
        assert!(format_timestamp(1_700_000_000_000).starts_with("20"));
    }
}
