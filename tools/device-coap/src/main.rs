//! device-coap - CoAP device service
//!
//! Serves inbound readings pushed by CoAP devices and reads or writes device
//! resources on demand.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use devcoap_client::CoapDriver;
use devcoap_core::{codec, Directory, Value};
use devcoap_server::{CoapServer, IngestHandler, JsonLinesSink, Reading};
use devcoap_transport::SessionConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::{Secrets, ServiceConfig};

/// CoAP device service
#[derive(Parser)]
#[command(name = "device-coap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "res/configuration.toml")]
    config: PathBuf,

    /// Secrets file holding the driver PSK key
    #[arg(short, long, global = true)]
    secrets: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for readings posted by devices and print them as JSON lines
    Serve {
        /// Port override (5683 for NoSec, 5684 for PSK by default)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Read resources from a device
    Get {
        /// Device name
        device: String,

        /// Resource names
        #[arg(required = true)]
        resources: Vec<String>,
    },

    /// Write resources on a device
    Put {
        /// Device name
        device: String,

        /// `resource=value` pairs; each value is parsed as the resource's type
        #[arg(required = true)]
        values: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs)?;

    let config = ServiceConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    let secrets = cli
        .secrets
        .as_ref()
        .map(|path| {
            Secrets::from_file(path)
                .with_context(|| format!("Failed to load secrets {}", path.display()))
        })
        .transpose()?;
    let directory: Arc<dyn Directory> = Arc::new(config.build_directory()?);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match cli.command {
        Commands::Serve { port } => {
            let settings = config
                .driver_settings(secrets.as_ref())
                .context("Invalid driver configuration")?;
            serve(directory, settings.server_config(port), shutdown).await?;
        }

        Commands::Get { device, resources } => {
            let driver =
                CoapDriver::with_config(directory, SessionConfig::default(), shutdown.clone());
            get(&driver, &device, &resources).await?;
        }

        Commands::Put { device, values } => {
            let driver = CoapDriver::with_config(
                Arc::clone(&directory),
                SessionConfig::default(),
                shutdown.clone(),
            );
            let values = parse_values(directory.as_ref(), &device, &values)?;
            let pairs: Vec<(&str, Value)> = values
                .iter()
                .map(|(name, value)| (name.as_str(), value.clone()))
                .collect();
            driver
                .put(&device, &pairs)
                .await
                .with_context(|| format!("PUT on {} failed", device))?;
            info!("Wrote {} values to {}", pairs.len(), device);
        }
    }

    Ok(())
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to parse log level")?;

    // stdout carries readings; logs go to stderr
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn serve(
    directory: Arc<dyn Directory>,
    config: devcoap_server::ServerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let (sink, writer) = JsonLinesSink::stdout();
    let handler = Arc::new(IngestHandler::new(directory, Arc::new(sink)));

    let server = CoapServer::bind(config, handler)
        .await
        .context("Failed to start CoAP server")?;
    server.run(shutdown).await?;

    if tokio::time::timeout(Duration::from_secs(1), writer)
        .await
        .is_err()
    {
        warn!("Reading writer did not drain in time");
    }
    info!("Exiting gracefully");
    Ok(())
}

async fn get(driver: &CoapDriver, device: &str, resources: &[String]) -> Result<()> {
    let names: Vec<&str> = resources.iter().map(String::as_str).collect();
    let results = match driver.get(device, &names).await {
        Ok(results) => results,
        Err(e) => {
            error!("GET on {} failed: {}", device, e);
            return Err(e).with_context(|| format!("GET on {} failed", device));
        }
    };

    for (resource, result) in names.iter().zip(results) {
        let reading = Reading {
            device: device.to_string(),
            resource: resource.to_string(),
            result,
        };
        println!("{}", serde_json::to_string(&reading)?);
    }
    Ok(())
}

/// Split `resource=value` arguments and parse each value as the resource's
/// declared type
fn parse_values(
    directory: &dyn Directory,
    device: &str,
    args: &[String],
) -> Result<Vec<(String, Value)>> {
    if directory.device(device).is_none() {
        bail!("Device {} not found", device);
    }

    args.iter()
        .map(|arg| -> Result<(String, Value)> {
            let Some((name, text)) = arg.split_once('=') else {
                bail!("Expected resource=value, got {}", arg);
            };
            let Some(resource) = directory.resource(device, name) else {
                bail!("Resource {} not found on device {}", name, device);
            };
            let value = codec::decode(&resource.value_type, text.as_bytes())
                .with_context(|| format!("Invalid {} value for {}", resource.value_type, name))?;
            Ok((name.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcoap_core::{DeviceProfile, InMemoryDirectory, Protocols, ResourceRecord};

    fn directory() -> InMemoryDirectory {
        let directory = InMemoryDirectory::new();
        directory.add_profile(
            DeviceProfile::new("sensor")
                .with_resource(ResourceRecord::new("temperature", "Float64"))
                .with_resource(ResourceRecord::new("count", "Int32"))
                .with_resource(ResourceRecord::new("label", "String")),
        );
        directory
            .add_device("dev1", &["sensor"], Protocols::new())
            .unwrap();
        directory
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_values_by_declared_type() {
        let values = parse_values(
            &directory(),
            "dev1",
            &args(&["temperature=21.5", "count=7", "label=a=b"]),
        )
        .unwrap();
        assert_eq!(
            values,
            vec![
                ("temperature".to_string(), Value::Float64(21.5)),
                ("count".to_string(), Value::Int32(7)),
                ("label".to_string(), Value::String("a=b".to_string())),
            ]
        );
    }

    #[test]
    fn test_parse_values_rejects_bad_input() {
        let directory = directory();
        assert!(parse_values(&directory, "dev1", &args(&["count"])).is_err());
        assert!(parse_values(&directory, "dev1", &args(&["count=12a"])).is_err());
        assert!(parse_values(&directory, "dev1", &args(&["nope=1"])).is_err());
        assert!(parse_values(&directory, "dev9", &args(&["count=1"])).is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["device-coap", "get", "dev1", "temperature", "count"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("res/configuration.toml"));
        match cli.command {
            Commands::Get { device, resources } => {
                assert_eq!(device, "dev1");
                assert_eq!(resources, vec!["temperature", "count"]);
            }
            _ => panic!("expected get"),
        }

        assert!(Cli::try_parse_from(["device-coap", "get", "dev1"]).is_err());
        let cli = Cli::try_parse_from(["device-coap", "--json-logs", "serve", "-p", "0"]).unwrap();
        assert!(cli.json_logs);
        assert!(matches!(cli.command, Commands::Serve { port: Some(0) }));
    }
}
