//! DigiBot: EMA + RSI paper-trading bot
//!
//! Usage:
//!   digibot run --symbols BTCUSDT,ETHUSDT       - Poll and print the dashboard
//!   digibot serve --port 3001                   - Poll and expose the latest cycle over HTTP
//!   digibot replay --symbol BTCUSDT --bars 1000 - Replay recent history bar by bar

use axum::{extract::State, response::Json, routing::get, Router};
use clap::{Parser, Subcommand};
use engine::{
    account_balance_for, market_data_for, order_hook_for, BinanceClient, BotConfig, BybitClient,
    CommandResponder, ConsoleSink, CycleRunner, ExchangeKind, Kline, Preset, ReplayRunner,
    ReportSink, SnapshotStore, TelegramClient, TelegramSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "digibot")]
#[command(about = "EMA + RSI signal bot with a simulated wallet", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Trading mode preset: scalp, hedge, swing
    #[arg(long, global = true)]
    preset: Option<Preset>,

    /// Symbols to trade (comma-separated), overrides config and environment
    #[arg(long, global = true, value_delimiter = ',')]
    symbols: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the exchange and print the dashboard every cycle
    Run,
    /// Poll the exchange and serve the latest cycle report over HTTP
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Replay recent history for one symbol through the ledger
    Replay {
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,
        /// Number of bars to fetch (max 1000)
        #[arg(long, default_value_t = 1000)]
        bars: u32,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,digibot=debug")
    } else {
        EnvFilter::new("info,engine=info,digibot=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

/// Defaults, then file, then environment, then CLI flags.
fn load_config(cli: &Cli) -> anyhow::Result<BotConfig> {
    let mut config = BotConfig::load(cli.config.as_deref())?;
    if let Some(preset) = cli.preset {
        config.apply_preset(preset);
    }
    if !cli.symbols.is_empty() {
        config.symbols = engine::config::parse_symbols(&cli.symbols.join(","));
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    let config = load_config(&cli).map_err(|e| {
        error!("Invalid configuration: {}", e);
        e
    })?;

    match cli.command {
        Commands::Run => {
            cmd_run(config).await?;
        }
        Commands::Serve { host, port } => {
            cmd_serve(config, &host, port).await?;
        }
        Commands::Replay {
            symbol,
            bars,
            export,
        } => {
            cmd_replay(config, &symbol, bars, export).await?;
        }
    }

    Ok(())
}

fn build_runner(config: &BotConfig) -> anyhow::Result<CycleRunner> {
    let market = market_data_for(config)?;
    let orders = order_hook_for(config)?;
    Ok(CycleRunner::new(config.clone(), market).with_order_hook(orders))
}

fn build_sinks(config: &BotConfig) -> anyhow::Result<Vec<Arc<dyn ReportSink>>> {
    let mut sinks: Vec<Arc<dyn ReportSink>> = vec![Arc::new(ConsoleSink)];
    let telegram = &config.telegram;
    if telegram.enabled {
        if let (Some(token), Some(chat_id)) = (&telegram.bot_token, &telegram.chat_id) {
            let client = Arc::new(TelegramClient::new(token.clone())?);
            sinks.push(Arc::new(TelegramSink::new(
                client,
                chat_id.clone(),
                telegram.broadcast_every_cycles,
            )));
        }
    }
    Ok(sinks)
}

/// Answer /status and /balance in the broadcast chat until Ctrl+C
fn spawn_commands(
    config: &BotConfig,
    snapshots: &SnapshotStore,
) -> anyhow::Result<Option<JoinHandle<()>>> {
    let telegram = &config.telegram;
    let (true, true, Some(token), Some(chat_id)) = (
        telegram.enabled,
        telegram.commands,
        &telegram.bot_token,
        &telegram.chat_id,
    ) else {
        return Ok(None);
    };

    let client = Arc::new(TelegramClient::new(token.clone())?);
    let mut responder =
        CommandResponder::new(client.clone(), client, chat_id.clone(), snapshots.clone());
    if let Some(balance) = account_balance_for(config)? {
        responder = responder.with_account_balance(balance);
    }
    Ok(Some(tokio::spawn(async move {
        responder.run(shutdown_signal()).await;
    })))
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("Ctrl+C received, stopping after the current cycle...");
}

fn print_banner(config: &BotConfig) {
    println!("\n=== DigiBot v{} ===", APP_VERSION);
    println!(
        "Exchange: {}{} | Symbols: {}",
        config.exchange,
        if config.testnet { " (testnet)" } else { "" },
        config.symbols.join(", ")
    );
    println!(
        "EMA {}/{} | RSI {} ({}/{}) | every {}s",
        config.indicators.ema_fast,
        config.indicators.ema_slow,
        config.indicators.rsi_period,
        config.signal.overbought,
        config.signal.oversold,
        config.poll_interval_secs
    );
    println!(
        "Wallet: {} USDT | Telegram: {}{} | Orders: {}",
        config.starting_cash,
        if config.telegram.enabled { "on" } else { "off" },
        if config.telegram.enabled && config.telegram.commands {
            " (+commands)"
        } else {
            ""
        },
        if config.orders.enabled { "bybit" } else { "paper" }
    );
    println!("\nPress Ctrl+C to stop\n");
}

// ============================================================================
// Run command: console loop
// ============================================================================

async fn cmd_run(config: BotConfig) -> anyhow::Result<()> {
    print_banner(&config);
    let snapshots = SnapshotStore::new();
    let mut sinks = build_sinks(&config)?;
    sinks.push(Arc::new(snapshots.clone()));
    let commands = spawn_commands(&config, &snapshots)?;

    let mut runner = build_runner(&config)?;
    runner.run(&sinks, shutdown_signal()).await;

    if let Some(handle) = commands {
        handle.await?;
    }
    Ok(())
}

// ============================================================================
// Serve command: loop plus Axum snapshot server
// ============================================================================

#[derive(Clone)]
struct AppState {
    snapshots: SnapshotStore,
}

async fn cmd_serve(config: BotConfig, host: &str, port: u16) -> anyhow::Result<()> {
    info!("DigiBot v{} starting...", APP_VERSION);

    let snapshots = SnapshotStore::new();
    let mut sinks = build_sinks(&config)?;
    sinks.push(Arc::new(snapshots.clone()));

    let commands = spawn_commands(&config, &snapshots)?;

    let mut runner = build_runner(&config)?;
    let runner_handle = tokio::spawn(async move {
        runner.run(&sinks, shutdown_signal()).await;
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/snapshot", get(api_snapshot))
        .with_state(AppState { snapshots });

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    print_banner(&config);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health    - Health check");
    println!("  GET  /api/snapshot  - Latest cycle report (null before the first cycle)\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runner_handle.await?;
    if let Some(handle) = commands {
        handle.await?;
    }
    Ok(())
}

async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": APP_VERSION,
    }))
}

async fn api_snapshot(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.snapshots.latest().await {
        Some(report) => Json(serde_json::to_value(report).unwrap_or_default()),
        None => Json(serde_json::Value::Null),
    }
}

// ============================================================================
// Replay command
// ============================================================================

async fn fetch_history(config: &BotConfig, symbol: &str, bars: u32) -> anyhow::Result<Vec<Kline>> {
    let klines = match config.exchange {
        ExchangeKind::Bybit => {
            BybitClient::new(config.testnet, config.kline_interval_mins, bars)?
                .get_klines(symbol, None)
                .await?
        }
        ExchangeKind::Binance => {
            BinanceClient::new(config.kline_interval_mins, bars)?
                .get_klines(symbol, None, None, None)
                .await?
        }
    };
    Ok(klines)
}

async fn cmd_replay(
    config: BotConfig,
    symbol: &str,
    bars: u32,
    export: Option<PathBuf>,
) -> anyhow::Result<()> {
    println!("\n=== DigiBot v{} replay ===", APP_VERSION);
    let symbol = symbol.to_uppercase();

    let klines = fetch_history(&config, &symbol, bars).await?;
    if klines.is_empty() {
        anyhow::bail!("No klines returned for {}", symbol);
    }
    println!(
        "{} {} bars of {}m from {}",
        symbol,
        klines.len(),
        config.kline_interval_mins,
        config.exchange
    );

    let summary = ReplayRunner::run(&config, &symbol, &klines);

    println!(
        "\nTrades: {} (won {}, {}%)",
        summary.closed_trades,
        summary.winning_trades,
        summary.win_rate.round_dp(1)
    );
    println!(
        "PnL: {} USDT ({}%)",
        summary.total_pnl.round_dp(4),
        summary.total_pnl_pct.round_dp(2)
    );
    println!(
        "Wallet: {} | Vault: {} | Harvested: {}",
        summary.final_wallet.round_dp(4),
        summary.vault.round_dp(4),
        summary.harvested.round_dp(4)
    );
    println!(
        "Max drawdown: {} ({}%)",
        summary.max_drawdown.round_dp(4),
        summary.max_drawdown_pct.round_dp(2)
    );

    if let Some(path) = export {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(&path, json)?;
        println!("\nExported to {}", path.display());
    }

    Ok(())
}
