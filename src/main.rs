//! Volley - automated on-chain trade execution engine
//!
//! The binary wires the engine for its operating mode and runs the main
//! loop. Simulation mode runs the full lifecycle against the paper
//! collaborators: a scripted market moves prices while the engine buys,
//! manages, and exits a position, so the whole pipeline can be watched
//! end to end without touching a network.

#![deny(unused_imports)]
#![deny(unused_mut)]
#![warn(unused_must_use)]

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use volley::engine::TradeOptions;
use volley::interfaces::RelayEndpoint;
use volley::paper::{PaperFeeEstimator, PaperQuoteSource, PaperRelay, PaperRpc, PaperSafety, UNIT};
use volley::position::{ExitPlan, TakeProfitSpec};
use volley::wallet::ManagedAccount;
use volley::{Address, Asset, Config, Engine, Mode};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Operating mode (simulation or production)
    #[arg(short, long, default_value = "simulation")]
    mode: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    info!("starting volley execution engine");
    info!("version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    let mode = match args.mode.as_str() {
        "production" => Mode::Production,
        "simulation" => Mode::Simulation,
        other => {
            warn!("unknown mode '{}', defaulting to simulation", other);
            Mode::Simulation
        }
    };
    info!(?mode, "operating mode selected");

    match mode {
        Mode::Simulation => run_simulation(config).await,
        Mode::Production => {
            // The production collaborators (quote source, safety oracle,
            // RPC access) live in the embedding deployment; the binary
            // only ships the paper wiring.
            error!("production mode requires external collaborator wiring; see volley::Engine::new");
            anyhow::bail!("production mode not wired in this binary")
        }
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        "volley=debug,info"
    } else {
        "volley=info,warn,error"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    Ok(())
}

fn load_config(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file_with_env(path)
            .with_context(|| format!("failed to load config from {}", path))
    } else {
        warn!("config file '{}' not found, using defaults", path);
        Ok(Config::default())
    }
}

/// Full-lifecycle dry run against the paper collaborators
async fn run_simulation(mut config: Config) -> Result<()> {
    // Simulation keeps its own fast cadence regardless of the file
    config.monitor.tick_interval_ms = config.monitor.tick_interval_ms.min(500);

    let quotes = Arc::new(PaperQuoteSource::new());
    let rpc = Arc::new(PaperRpc::with_quotes(quotes.clone()));
    let relay: Arc<dyn RelayEndpoint> = Arc::new(
        PaperRelay::accepting("paper-relay")
            .with_ledger(rpc.clone())
            .with_fill_enforcement(quotes.clone()),
    );

    let engine = Arc::new(Engine::new(
        config,
        Mode::Simulation,
        quotes.clone(),
        Arc::new(PaperSafety::allow_all()),
        Arc::new(PaperFeeEstimator::default()),
        rpc.clone(),
        vec![relay],
    ));

    let account_id = engine.register_account(ManagedAccount::generate("sim-trader"));
    let token = Asset::Token(Address([0x42; 20]));
    let mut rate = 1_000.0;
    quotes.set_rate(token, rate);

    // Event feed, as a notification surface would consume it
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(event = event.name(), "lifecycle event");
        }
    });

    info!(asset = %token, "entering managed position");
    let order = engine
        .buy(
            token,
            UNIT,
            account_id,
            TradeOptions {
                auto_manage: true,
                exit_plan: Some(ExitPlan {
                    take_profits: vec![
                        TakeProfitSpec {
                            gain_percent: 25.0,
                            sell_fraction: 0.5,
                        },
                        TakeProfitSpec {
                            gain_percent: 60.0,
                            sell_fraction: 1.0,
                        },
                    ],
                    stop_loss_percent: Some(15.0),
                    trailing_stop_percent: Some(20.0),
                }),
                tags: vec!["sim".to_string()],
                ..Default::default()
            },
        )
        .await?;
    info!(
        order_id = %order.id,
        state = ?order.state,
        expected_out = order.expected_out,
        "entry order finished"
    );

    engine.start();

    let mut market = tokio::time::interval(std::time::Duration::from_millis(750));
    let mut report = tokio::time::interval(std::time::Duration::from_secs(10));

    loop {
        tokio::select! {
            // Scripted random walk with a gentle upward drift, so the
            // ladder and trailing stop all get exercised eventually
            _ = market.tick() => {
                let step = 0.97 + fastrand::f64() * 0.05;
                rate *= step;
                quotes.set_rate(token, rate);
                rpc.advance_block();

                let open = engine.positions().snapshot_all().await
                    .into_iter()
                    .filter(|p| p.is_open())
                    .count();
                if open == 0 {
                    info!("all positions closed, simulation complete");
                    break;
                }
            }

            _ = report.tick() => {
                let stats = engine.stats();
                info!(
                    orders_created = stats.orders_created,
                    orders_confirmed = stats.orders_confirmed,
                    orders_failed = stats.orders_failed,
                    positions_open = stats.positions_opened - stats.positions_closed,
                    "engine statistics"
                );
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    engine.shutdown();
    let stats = engine.stats();
    info!(
        orders_confirmed = stats.orders_confirmed,
        positions_closed = stats.positions_closed,
        "simulation finished"
    );
    Ok(())
}
