//! Candle Backtester - Main Entry Point

use anyhow::{Context, Result};
use candle_backtester::backtest::{
    BacktestEngine, BacktestResult, EngineConfig, ParameterSpace, SweepRunner,
};
use candle_backtester::config::Config;
use candle_backtester::market::{BinanceKlineClient, Candle, CandleSource, CsvCandleLoader, Interval};
use candle_backtester::notify::{format_signal_message, TelegramNotifier};
use candle_backtester::persistence::PersistenceManager;
use candle_backtester::risk::RiskManager;
use candle_backtester::strategy::{Side, StrategyRegistry};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Candle Backtester CLI
#[derive(Parser)]
#[command(name = "candle-backtester")]
#[command(version, about = "Bar-by-bar backtesting of spot trading signals")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where candles come from. Unset fields fall back to configuration.
#[derive(Args, Debug, Clone)]
struct DataArgs {
    /// Trading pair, e.g. BTCUSDT
    #[arg(short, long)]
    symbol: Option<String>,

    /// Bar interval (1m, 5m, 15m, 30m, 1h, 4h, 1d, 1w)
    #[arg(short, long)]
    interval: Option<Interval>,

    /// Number of bars to load
    #[arg(short, long)]
    lookback: Option<usize>,

    /// Read candles from a CSV file instead of Binance
    #[arg(short, long)]
    data: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backtest simulation on historical data
    Backtest {
        #[command(flatten)]
        data: DataArgs,

        /// Strategy name (see `strategies`)
        #[arg(long)]
        strategy: Option<String>,

        /// Initial capital for simulation
        #[arg(short = 'c', long)]
        capital: Option<Decimal>,

        /// Allow several tagged entries at once
        #[arg(long)]
        multi: bool,

        /// Output directory for equity and trade CSVs
        #[arg(short, long)]
        output: Option<String>,

        /// Store the run in the database
        #[arg(long)]
        save: bool,
    },

    /// Run a parameter sweep optimization
    Sweep {
        #[command(flatten)]
        data: DataArgs,

        /// Strategy name (see `strategies`)
        #[arg(long)]
        strategy: Option<String>,

        /// Number of parallel backtests
        #[arg(short, long)]
        parallelism: Option<usize>,

        /// Output directory for results
        #[arg(short, long)]
        output: Option<String>,

        /// Use minimal parameter space (faster, for testing)
        #[arg(long)]
        minimal: bool,
    },

    /// Download candles into the local cache
    Fetch {
        #[command(flatten)]
        data: DataArgs,

        /// Also write the candles to this CSV file
        #[arg(long)]
        csv: Option<String>,
    },

    /// Evaluate a strategy on the latest bar
    Signal {
        #[command(flatten)]
        data: DataArgs,

        /// Strategy name (see `strategies`)
        #[arg(long)]
        strategy: Option<String>,

        /// Send actionable signals to Telegram
        #[arg(long)]
        notify: bool,
    },

    /// List available strategies
    Strategies,

    /// Show stored backtest runs
    Runs {
        /// Maximum runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    let _guard = init_logging(cli.json)?;

    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Backtest {
            data,
            strategy,
            capital,
            multi,
            output,
            save,
        } => {
            run_backtest(
                &config,
                &data,
                strategy.as_deref(),
                capital,
                multi,
                output.as_deref(),
                save,
            )
            .await
        }
        Commands::Sweep {
            data,
            strategy,
            parallelism,
            output,
            minimal,
        } => {
            run_sweep(
                &config,
                &data,
                strategy.as_deref(),
                parallelism,
                output.as_deref(),
                minimal,
            )
            .await
        }
        Commands::Fetch { data, csv } => run_fetch(&config, &data, csv.as_deref()).await,
        Commands::Signal {
            data,
            strategy,
            notify,
        } => run_signal(&config, &data, strategy.as_deref(), notify).await,
        Commands::Strategies => {
            list_strategies(&config);
            Ok(())
        }
        Commands::Runs { limit } => show_runs(&config, limit),
    }
}

/// Initialize logging to stdout and a daily log file.
fn init_logging(json: bool) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", "backtester.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::from_default_env()
        .add_directive("candle_backtester=info".parse()?)
        .add_directive(Level::WARN.into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false);

    if json {
        builder.json().init();
    } else {
        builder.with_ansi(false).init();
    }

    Ok(guard)
}

/// Resolve data arguments against configuration.
struct DataRequest {
    symbol: String,
    interval: Interval,
    lookback: usize,
    csv_path: Option<String>,
}

impl DataRequest {
    fn new(config: &Config, args: &DataArgs) -> Self {
        Self {
            symbol: args.symbol.clone().unwrap_or_else(|| config.data.symbol.clone()),
            interval: args.interval.unwrap_or(config.data.interval),
            lookback: args.lookback.unwrap_or(config.data.lookback),
            csv_path: args.data.clone().or_else(|| config.data.csv_path.clone()),
        }
    }
}

/// Load candles from CSV, or from Binance with the SQLite cache as fallback.
async fn load_candles(config: &Config, request: &DataRequest) -> Result<Vec<Candle>> {
    if let Some(path) = &request.csv_path {
        info!("📊 Loading data from: {}", path);
        let loader = CsvCandleLoader::new(path)?;
        return loader
            .fetch(&request.symbol, request.interval, request.lookback)
            .await;
    }

    let client = BinanceKlineClient::new(&config.data.binance_base_url)?;
    match client
        .fetch(&request.symbol, request.interval, request.lookback)
        .await
    {
        Ok(candles) => {
            if let Err(e) = open_store(config)
                .and_then(|store| store.upsert_candles(&request.symbol, request.interval, &candles))
            {
                warn!(error = %e, "Failed to cache candles");
            }
            Ok(candles)
        }
        Err(e) => {
            warn!(error = %e, "Binance unavailable, using cached candles");
            let cached =
                open_store(config)?.load_candles(&request.symbol, request.interval, request.lookback)?;
            anyhow::ensure!(
                !cached.is_empty(),
                "No candles for {} {} (fetch failed: {})",
                request.symbol,
                request.interval,
                e
            );
            Ok(cached)
        }
    }
}

fn open_store(config: &Config) -> Result<PersistenceManager> {
    if let Some(parent) = Path::new(&config.data.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    PersistenceManager::new(&config.data.db_path)
}

fn log_data_range(candles: &[Candle]) {
    if let (Some(first), Some(last)) = (candles.first(), candles.last()) {
        info!(
            "   Data range: {} to {} ({} bars)",
            first.timestamp.format("%Y-%m-%d %H:%M"),
            last.timestamp.format("%Y-%m-%d %H:%M"),
            candles.len()
        );
    }
}

/// Run a single backtest.
async fn run_backtest(
    config: &Config,
    data: &DataArgs,
    strategy: Option<&str>,
    capital: Option<Decimal>,
    multi: bool,
    output_dir: Option<&str>,
    save: bool,
) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║              BACKTEST MODE                                 ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    let request = DataRequest::new(config, data);
    let candles = load_candles(config, &request).await?;
    log_data_range(&candles);

    let registry = StrategyRegistry::with_defaults(&config.strategy);
    let provider = registry.get(strategy.unwrap_or(&config.strategy.name))?;

    let mut settings = config.backtest.clone();
    if let Some(capital) = capital {
        settings.initial_capital = capital;
    }
    settings.multi_position |= multi;
    let engine_config = EngineConfig::from_settings(&settings, request.interval);

    info!("💰 Initial capital: ${}", engine_config.initial_capital);
    info!("📈 Strategy: {}", provider.name());

    let engine = BacktestEngine::new(engine_config, config.risk.clone(), provider)?;
    let result = engine.run(&candles);

    println!("\n{}", result.summary());

    if let Some(dir) = output_dir {
        write_outputs(dir, &result)?;
    }

    if save {
        let run_id = open_store(config)?.save_run(&request.symbol, &result)?;
        info!("💾 Run saved with id {}", run_id);
    }

    Ok(())
}

fn write_outputs(dir: &str, result: &BacktestResult) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let equity_path = format!("{}/equity_curve.csv", dir);
    result.equity_to_csv(&equity_path)?;
    info!("📁 Equity curve saved to: {}", equity_path);

    let trades_path = format!("{}/trades.csv", dir);
    result.trades_to_csv(&trades_path)?;
    info!("📁 Trades saved to: {}", trades_path);

    let summary_path = format!("{}/result.json", dir);
    std::fs::write(&summary_path, serde_json::to_string_pretty(result)?)?;
    info!("📁 Result saved to: {}", summary_path);

    Ok(())
}

/// Run a parameter sweep optimization.
async fn run_sweep(
    config: &Config,
    data: &DataArgs,
    strategy: Option<&str>,
    parallelism: Option<usize>,
    output_dir: Option<&str>,
    minimal: bool,
) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║           PARAMETER SWEEP MODE                             ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    let request = DataRequest::new(config, data);
    let candles = load_candles(config, &request).await?;
    log_data_range(&candles);

    let registry = StrategyRegistry::with_defaults(&config.strategy);
    let provider = registry.get(strategy.unwrap_or(&config.strategy.name))?;

    let param_space = if minimal {
        info!("🔧 Using minimal parameter space (quick test)");
        ParameterSpace::minimal()
    } else {
        info!("🔧 Using full parameter space");
        ParameterSpace::default()
    };
    info!("   Combinations: {}", param_space.combination_count());

    let runner = SweepRunner::new(
        param_space,
        config.risk.clone(),
        EngineConfig::from_settings(&config.backtest, request.interval),
        provider,
        parallelism.unwrap_or(config.backtest.sweep_concurrency),
    );
    let results = runner.run(Arc::new(candles)).await?;

    println!("\n{}", results.summary());

    if let Some(dir) = output_dir {
        std::fs::create_dir_all(dir)?;

        let results_path = format!("{}/sweep_results.csv", dir);
        results.to_csv(&results_path)?;
        info!("📁 Results saved to: {}", results_path);

        if let Some((_, best)) = results.best_return() {
            write_outputs(&format!("{}/best_return", dir), best)?;
        }
    }

    Ok(())
}

/// Download candles and store them.
async fn run_fetch(config: &Config, data: &DataArgs, csv_path: Option<&str>) -> Result<()> {
    let request = DataRequest::new(config, data);
    let client = BinanceKlineClient::new(&config.data.binance_base_url)?;

    info!(
        "📥 Fetching {} bars of {} {}",
        request.lookback, request.symbol, request.interval
    );
    let candles = client
        .fetch(&request.symbol, request.interval, request.lookback)
        .await?;
    log_data_range(&candles);

    let stored = open_store(config)?.upsert_candles(&request.symbol, request.interval, &candles)?;
    info!("💾 Cached {} candles in {}", stored, config.data.db_path);

    if let Some(path) = csv_path {
        CsvCandleLoader::write(path, &candles)?;
        info!("📁 Candles saved to: {}", path);
    }

    Ok(())
}

/// Evaluate the configured strategy on the most recent bar.
async fn run_signal(
    config: &Config,
    data: &DataArgs,
    strategy: Option<&str>,
    notify: bool,
) -> Result<()> {
    let request = DataRequest::new(config, data);
    let registry = StrategyRegistry::with_defaults(&config.strategy);
    let provider = registry.get(strategy.unwrap_or(&config.strategy.name))?;

    let candles = load_candles(config, &request).await?;
    let last = candles.last().context("No candles loaded")?;
    anyhow::ensure!(
        candles.len() >= provider.min_lookback(),
        "{} needs {} bars, only {} loaded",
        provider.name(),
        provider.min_lookback(),
        candles.len()
    );

    let signal = provider.evaluate(&candles)?;
    signal.validate()?;

    let risk = RiskManager::new(config.risk.clone());
    let levels = risk.exit_levels(last.close, &candles);
    let message = format_signal_message(
        &request.symbol,
        provider.name(),
        &signal,
        last.close,
        &levels,
        Utc::now(),
    );
    println!("{}", message);

    let actionable = signal.side != Side::Hold && risk.passes_confidence(&signal);
    if notify && actionable {
        match TelegramNotifier::from_config(&config.telegram)? {
            Some(notifier) => notifier.send_message(&message).await?,
            None => warn!("Telegram is not configured; set CBT__TELEGRAM__BOT_TOKEN and CBT__TELEGRAM__CHAT_ID"),
        }
    } else if notify {
        info!(
            side = %signal.side,
            confidence = signal.confidence,
            "Signal not actionable, nothing sent"
        );
    }

    Ok(())
}

fn list_strategies(config: &Config) {
    let registry = StrategyRegistry::with_defaults(&config.strategy);
    println!("Available strategies:");
    for name in registry.names() {
        let marker = if name == config.strategy.name { " (default)" } else { "" };
        println!("  {}{}", name, marker);
    }
}

/// Show stored backtest runs.
fn show_runs(config: &Config, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let runs = store.list_runs(limit)?;

    if runs.is_empty() {
        println!("No stored runs in {}", config.data.db_path);
        return Ok(());
    }

    println!("═══════════════════════════════════════════════════════════════════════════════");
    println!(
        "{:<5} {:<17} {:<10} {:<14} {:<4} {:>9} {:>8} {:>8} {:>7}",
        "ID", "CREATED", "SYMBOL", "STRATEGY", "INT", "RETURN", "SHARPE", "MAXDD", "TRADES"
    );
    println!("═══════════════════════════════════════════════════════════════════════════════");
    for run in runs {
        println!(
            "{:<5} {:<17} {:<10} {:<14} {:<4} {:>8.2}% {:>8.3} {:>7.2}% {:>7}",
            run.id,
            run.created_at.format("%Y-%m-%d %H:%M"),
            run.symbol,
            run.strategy,
            run.interval,
            run.total_return * 100.0,
            run.sharpe_ratio,
            run.max_drawdown * 100.0,
            run.total_trades,
        );
    }

    Ok(())
}
