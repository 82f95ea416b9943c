use std::process;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use connector::model::COMPACT_DATE;
use connector::{app, datasets, proxy, tables};
use connector_core::{telemetry, Config};

#[derive(Parser)]
#[clap(name = "connector")]
#[clap(about = "Search-analytics dataset extraction connector", version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the forwarding proxy gateway
    Proxy {
        /// Override the listen port
        #[clap(long, env = "PORT")]
        port: Option<u16>,
    },

    /// Fetch one table (and its dependencies) and emit rows as JSON lines
    Fetch {
        /// Registered table id
        table: String,

        /// Window start, compact form (YYYYMMDD)
        #[clap(long, env = "EXTRACT_START", value_parser = parse_compact_date)]
        start_date: Option<NaiveDate>,

        /// Window end, compact form (YYYYMMDD)
        #[clap(long, env = "EXTRACT_END", value_parser = parse_compact_date)]
        end_date: Option<NaiveDate>,
    },

    /// List registered tables in dependency order
    Tables,
}

fn parse_compact_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, COMPACT_DATE)
        .map_err(|e| format!("expected YYYYMMDD, got '{raw}': {e}"))
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Fatal error");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    // Load configuration
    let mut config =
        Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    // Initialize telemetry
    telemetry::init(&config.telemetry)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Proxy { port } => {
            let port = port.unwrap_or(config.proxy.port);
            let state = Arc::new(proxy::ProxyState::new(
                &config.proxy,
                config.retry.forward.clone(),
                config.api.request_timeout_secs,
            )?);
            proxy::serve(state, port).await?;
        }

        Commands::Fetch {
            table,
            start_date,
            end_date,
        } => {
            // Override config with CLI args
            if let Some(start) = start_date {
                config.extract.start_date = Some(start);
            }
            if let Some(end) = end_date {
                config.extract.end_date = Some(end);
            }

            info!(
                table = %table,
                start = ?config.extract.start_date,
                end = ?config.extract.end_date,
                "Starting extraction"
            );

            let app = app::App::new(config)?;
            app.fetch_table(&table).await?;
        }

        Commands::Tables => {
            let mut registry = tables::TableRegistry::new();
            datasets::register_builtin(&mut registry, config.extract.page_size)?;
            for id in registry.topo_order()? {
                println!("{id}");
            }
        }
    }

    telemetry::shutdown();
    Ok(())
}
