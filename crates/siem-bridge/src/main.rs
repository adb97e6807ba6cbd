// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SIEM Bridge CLI
//!
//! Consumes security events from NATS JetStream subjects and lands them in
//! a ClickHouse `threats` table.
//!
//! # Usage
//!
//! ```bash
//! # Run with environment configuration
//! siem-bridge
//!
//! # Run with a YAML config file (environment still wins)
//! siem-bridge --config bridge.yaml
//!
//! # Run against in-memory bus/store (no external services)
//! siem-bridge --mock
//!
//! # Assert the threats schema and exit
//! siem-bridge init-schema
//!
//! # Probe bus and store reachability
//! siem-bridge check
//! ```
//!
//! Exit codes: 0 graceful, 1 fatal initialization failure, 2 unrecoverable
//! mid-run failure.

use anyhow::Result;
use clap::{Parser, Subcommand};
use siem_bridge::enrich::{GeoProvider, HttpGeoProvider, NullGeoProvider};
use siem_bridge::{
    BridgeService, ClickHouseStore, ColumnarStore, Config, MemoryBus, MemoryStore, MessageBus,
    NatsBus,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "siem-bridge")]
#[command(about = "Security-event bridge: message bus to columnar store", long_about = None)]
#[command(version)]
struct Args {
    /// Optional YAML config file (environment variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use in-memory bus and store (for testing without external services)
    #[arg(long)]
    mock: bool,

    /// Override the metrics endpoint port
    #[arg(long)]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Consume and bridge events (default)
    Run,
    /// Assert the threats table schema, then exit
    InitSchema,
    /// Probe bus and store reachability, then exit
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(1);
        }
    };
    if let Some(port) = args.metrics_port {
        config.metrics_port = port;
    }

    init_tracing(&config.log_level);

    let command = args.command.unwrap_or(Commands::Run);
    let result = if args.mock {
        tracing::info!("running with in-memory bus and store");
        dispatch(command, config, MemoryBus::new(), MemoryStore::new()).await
    } else {
        let bus = match NatsBus::connect(&config).await {
            Ok(bus) => bus,
            Err(e) => {
                tracing::error!("bus connection failed: {e:#}");
                return ExitCode::from(1);
            }
        };
        let store = match ClickHouseStore::new(&config) {
            Ok(store) => store,
            Err(e) => {
                tracing::error!("store client construction failed: {e:#}");
                return ExitCode::from(1);
            }
        };
        dispatch(command, config, bus, store).await
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("bridge failed: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn dispatch<B: MessageBus, S: ColumnarStore>(
    command: Commands,
    config: Config,
    bus: B,
    store: S,
) -> Result<ExitCode> {
    let geo = geo_provider(&config)?;

    match command {
        Commands::Check => {
            if !bus.is_connected() {
                tracing::error!("bus check failed: not connected");
                return Ok(ExitCode::from(1));
            }
            if let Err(e) = store.ping().await {
                tracing::error!("store check failed: {e}");
                return Ok(ExitCode::from(1));
            }
            println!("bus ok, store ok");
            Ok(ExitCode::SUCCESS)
        }
        Commands::InitSchema => {
            let service = BridgeService::new(config, bus, store, geo);
            if let Err(e) = service.init().await {
                tracing::error!("initialization failed: {e:#}");
                return Ok(ExitCode::from(1));
            }
            println!("schema asserted");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run => {
            let service = BridgeService::new(config, bus, store, geo);
            if let Err(e) = service.init().await {
                tracing::error!("initialization failed: {e:#}");
                return Ok(ExitCode::from(1));
            }
            // Runtime errors surface as exit code 2 through main.
            service.run().await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn geo_provider(config: &Config) -> Result<Arc<dyn GeoProvider>> {
    match &config.geo_api_url {
        Some(url) => Ok(Arc::new(HttpGeoProvider::new(
            url.clone(),
            config.geo_timeout(),
        )?)),
        None => Ok(Arc::new(NullGeoProvider)),
    }
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
