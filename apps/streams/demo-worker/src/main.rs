//! Streams Demo Worker - Entry Point

use clap::{Parser, Subcommand};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv, app_info};
use eyre::{Result, WrapErr, eyre};
use streams_demo_worker::config::Config;
use tracing::info;

#[derive(Parser)]
#[command(name = "streams-demo-worker")]
#[command(about = "Consume and publish Redis stream consumer-group messages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the consumer groups until SIGINT/SIGTERM
    Consume,

    /// Publish messages to a group
    Publish {
        /// Target group (the stream key is `<group>Stream`)
        #[arg(short, long, default_value = "orders")]
        group: String,

        /// Message payload
        #[arg(short, long, default_value = r#"{"id":1,"amount_cents":1000}"#)]
        message: String,

        /// How many copies to publish
        #[arg(short, long, default_value_t = 1)]
        count: usize,

        /// Extra parameters as key=value
        #[arg(short, long, value_delimiter = ',')]
        param: Vec<String>,
    },
}

fn parse_params(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|p| {
            p.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| eyre!("parameter '{p}' is not key=value"))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting streams demo worker");

    let config = Config::from_env().wrap_err("Failed to load configuration")?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Consume => streams_demo_worker::consume(config).await,
        Commands::Publish {
            group,
            message,
            count,
            param,
        } => {
            let params = parse_params(&param)?;
            streams_demo_worker::publish(config, &group, &message, count, &params).await
        }
    }
}
