//! Bracket Guard - Main Entry Point
//!
//! Paper-trading runner, risk calculator and status viewer.

use anyhow::{Context, Result};
use bracket_guard::bracket::{
    BracketLinkRegistry, BracketOrderRequest, BracketPlacer, CascadeCanceller, OrderReconciler,
    ReconcilerService, SyntheticStopMonitor,
};
use bracket_guard::config::Config;
use bracket_guard::exchange::{ExchangeCapability, MockExchange};
use bracket_guard::model::PositionDirection;
use bracket_guard::persistence::{BracketStore, SqliteStore};
use bracket_guard::risk::{
    MarginThresholdEvaluator, MarketRegime, RiskInputs, RiskMode, RiskProfileResolver,
    StopLossPriceCalculator,
};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Bracket Guard CLI
#[derive(Parser)]
#[command(name = "bracket-guard")]
#[command(version, about = "Bracket-order lifecycle manager with leverage-aware risk")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bracket lifecycle against the paper exchange
    Run {
        /// Open a demo bracket on this symbol at startup
        #[arg(long)]
        demo: Option<String>,

        /// Demo entry price
        #[arg(long, default_value = "50000")]
        price: Decimal,

        /// Demo quantity
        #[arg(long, default_value = "0.1")]
        quantity: Decimal,

        /// Demo direction (long|short)
        #[arg(long, default_value = "long")]
        direction: PositionDirection,
    },

    /// Resolve risk settings and print TP/SL levels as JSON
    Risk {
        /// Entry price
        #[arg(short, long)]
        entry: Decimal,

        /// Position direction (long|short)
        #[arg(short, long, default_value = "long")]
        direction: PositionDirection,

        /// Leverage (defaults to the configured value)
        #[arg(short, long)]
        leverage: Option<Decimal>,

        /// Market regime (high_volatility|strong_trend|oscillation|sideways|normal)
        #[arg(short, long)]
        regime: Option<MarketRegime>,

        /// Risk mode (normal|conservative|aggressive)
        #[arg(short, long)]
        mode: Option<RiskMode>,

        /// Realized volatility as a fraction (0.03 = 3%)
        #[arg(short, long, default_value = "0")]
        volatility: Decimal,

        /// Loss already taken today, as a fraction of equity
        #[arg(long)]
        daily_loss: Option<Decimal>,
    },

    /// Show persisted brackets and external operations
    Status {
        /// Path to SQLite database (defaults to the configured path)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Number of rows to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Also list external operations
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Commands::Run {
            demo,
            price,
            quantity,
            direction,
        } => run(config, demo.map(|symbol| (symbol, price, quantity, direction))).await,
        Commands::Risk {
            entry,
            direction,
            leverage,
            regime,
            mode,
            volatility,
            daily_loss,
        } => {
            let mut inputs = RiskInputs::new(
                config.risk.base,
                leverage.unwrap_or(config.risk.leverage),
                regime.unwrap_or(config.risk.regime),
            )
            .with_volatility(volatility)
            .with_mode(mode.unwrap_or(config.risk.mode));
            if let Some(loss) = daily_loss {
                inputs = inputs.with_daily_loss(loss);
            }
            show_risk(&inputs, entry, direction)
        }
        Commands::Status { db, limit, verbose } => {
            let db = db.unwrap_or_else(|| config.persistence.db_path.clone());
            show_status(&db, limit, verbose)
        }
    }
}

/// Symbol, price, quantity and direction of the startup demo bracket.
type DemoBracket = (String, Decimal, Decimal, PositionDirection);

async fn run(config: Config, demo: Option<DemoBracket>) -> Result<()> {
    info!(
        "Bracket Guard v{} starting in paper mode",
        env!("CARGO_PKG_VERSION")
    );
    log_config(&config);

    if let Some(parent) = config.persistence.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store: Arc<dyn BracketStore> = Arc::new(SqliteStore::new(&config.persistence.db_path)?);
    let registry = Arc::new(BracketLinkRegistry::restore(store)?);

    let paper = Arc::new(MockExchange::new());
    let exchange: Arc<dyn ExchangeCapability> = paper.clone();

    let recon = &config.reconciliation;
    let cascade = Arc::new(CascadeCanceller::new(
        registry.clone(),
        exchange.clone(),
        config.cancellation.retry_policy(),
        recon.call_timeout(),
    ));
    let placer = Arc::new(BracketPlacer::new(
        registry.clone(),
        exchange.clone(),
        cascade.clone(),
        config.cancellation.retry_policy(),
        recon.call_timeout(),
        recon.account.clone(),
    ));
    let reconciler = Arc::new(OrderReconciler::new(
        registry.clone(),
        exchange.clone(),
        cascade,
        recon,
    ));
    let service = ReconcilerService::new(reconciler, recon.poll_interval());
    let monitor = SyntheticStopMonitor::new(
        registry.clone(),
        exchange,
        placer.clone(),
        MarginThresholdEvaluator::new(config.margin_stop),
        config.risk.leverage,
        recon.account.clone(),
        recon.call_timeout(),
    );

    let restored = registry.active_groups().await.len();
    if restored > 0 {
        warn!(
            groups = restored,
            "Restored active brackets; paper venue starts empty, expect external-close detection"
        );
    }

    if let Some((symbol, price, quantity, direction)) = demo {
        paper.set_price(&symbol, price).await;
        let request = BracketOrderRequest {
            symbol: symbol.clone(),
            direction,
            quantity,
            limit_price: None,
            risk: RiskInputs::new(
                config.risk.base,
                config.risk.leverage,
                config.risk.regime,
            )
            .with_mode(config.risk.mode),
        };
        match placer.open_bracket(request).await {
            Ok(placed) => info!(
                group_id = %placed.group_id,
                take_profit = %placed.levels.take_profit,
                stop_loss = %placed.levels.stop_loss,
                protected = placed.is_protected(),
                "Demo bracket opened"
            ),
            Err(e) => error!(%symbol, error = %e, "Demo bracket failed"),
        }
    }

    service.start().await;
    let mut passes = service.subscribe();
    let mut status_tick = tokio::time::interval(Duration::from_secs(60));

    info!("Running; press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            changed = passes.changed() => {
                if changed.is_err() {
                    break;
                }
                for (symbol, trigger) in monitor.check_all().await {
                    info!(%symbol, ?trigger, "Synthetic stop fired");
                }
            }
            _ = status_tick.tick() => {
                let active = registry.active_groups().await.len();
                info!(active_brackets = active, pass = passes.borrow().pass, "Status");
            }
        }
    }

    service.stop().await;
    info!("Bracket Guard shutdown complete");
    Ok(())
}

/// Initialize logging with both console and file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "bracket-guard.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("bracket_guard=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("Configuration:");
    info!("   Leverage: {}x", config.risk.leverage);
    info!("   Risk Mode: {:?}, Regime: {}", config.risk.mode, config.risk.regime.as_str());
    info!(
        "   Margin Stop: enabled={}, stop={}%, take-profit={}%",
        config.margin_stop.enabled, config.margin_stop.stop_loss_pct, config.margin_stop.take_profit_pct
    );
    info!(
        "   Reconciliation: every {}s, grace {}s, {} symbols in parallel",
        config.reconciliation.poll_interval_secs,
        config.reconciliation.grace_period_secs,
        config.reconciliation.max_concurrent_symbols
    );
    info!(
        "   Cancellation: {} attempts, backoff {}-{}ms",
        config.cancellation.max_attempts,
        config.cancellation.initial_backoff_ms,
        config.cancellation.max_backoff_ms
    );
    info!("   Database: {}", config.persistence.db_path.display());
}

fn show_risk(inputs: &RiskInputs, entry: Decimal, direction: PositionDirection) -> Result<()> {
    let risk = RiskProfileResolver::resolve(inputs)?;
    let volatility = inputs.volatility.unwrap_or(Decimal::ZERO);
    let levels = StopLossPriceCalculator::compute_levels(entry, direction, &risk, volatility)?;

    let output = serde_json::json!({
        "risk": risk,
        "entry_price": entry,
        "direction": direction,
        "levels": levels,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn show_status(db_path: &Path, limit: usize, verbose: bool) -> Result<()> {
    if !db_path.exists() {
        println!("Database not found: {}", db_path.display());
        println!("   Bracket Guard has not run yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = SqliteStore::new(db_path)?;
    let groups = store.list_groups(limit)?;

    println!("Brackets ({} most recent)", groups.len());
    for link in &groups {
        println!(
            "   {:<24} {:<12} {:<6} {:<10} {}",
            link.group_id,
            link.symbol,
            link.direction,
            link.status,
            link.close_reason.map(|r| r.as_str()).unwrap_or("-"),
        );
        if let Some(note) = &link.status_note {
            println!("      note: {note}");
        }
    }

    if verbose {
        let operations = store.list_external_operations(limit)?;
        println!("\nExternal operations ({})", operations.len());
        for op in &operations {
            println!(
                "   #{:<5} {:<12} {:<22} {} -> {} (confidence {}, {})",
                op.id,
                op.symbol,
                op.operation_type,
                op.old_amount,
                op.new_amount,
                op.confidence,
                op.status.as_str(),
            );
        }
    }

    Ok(())
}
