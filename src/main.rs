//! captable - cap-table ledger and rebalancing engine CLI
//!
//! ```text
//! captable init-venture --file venture.json
//! captable cap-table --venture acme
//! captable rebalance --start 2026-01-01T00:00:00Z --end 2026-04-01T00:00:00Z
//! captable tick
//! captable reconcile
//! captable daemon --tick-secs 60
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use captable_engine::ledger::GenesisAllocation;
use captable_engine::models::{
    Contribution, ContributionStatus, ConversionWindow, HolderType, TokenBalance, Venture,
};
use captable_engine::scheduler::{Clock, SystemClock};
use captable_engine::{
    to_pct, BroadcastEventSink, CapTableLedger, ContributionScorer, ConversionWindowManager,
    EngineConfig, EventSink, LedgerRepository, OpContext, RebalancingEngine, Rule, Scheduler,
    SqliteLedgerRepository,
};

#[derive(Parser, Debug)]
#[command(name = "captable")]
#[command(about = "Contribution-based equity rebalancing and cap-table ledger")]
struct Cli {
    /// Engine config (TOML). Falls back to CAPTABLE_CONFIG_PATH, then defaults.
    #[arg(short, long, env = "CAPTABLE_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a venture (and optional fixtures) from a JSON file
    InitVenture {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Print a venture's live cap table
    CapTable {
        #[arg(short, long)]
        venture: String,
    },

    /// Run a rebalancing period for one venture or all of them
    Rebalance {
        /// Period start (RFC 3339)
        #[arg(long)]
        start: DateTime<Utc>,

        /// Period end, exclusive (RFC 3339)
        #[arg(long)]
        end: DateTime<Utc>,

        #[arg(short, long)]
        venture: Option<String>,
    },

    /// Open and close due conversion windows once
    Tick,

    /// Compare live cap tables against the transaction log
    Reconcile {
        #[arg(short, long)]
        venture: Option<String>,
    },

    /// Tick conversion windows on an interval until ctrl-c
    Daemon {
        #[arg(long, default_value = "60")]
        tick_secs: u64,
    },
}

// =============================================================================
// INIT FILE
// =============================================================================

/// Venture file. Percentages are plain percentage points (`35.0` = 35%).
#[derive(Debug, Deserialize)]
struct VentureFile {
    venture: VentureSpec,
    genesis: Vec<GenesisSpec>,
    #[serde(default)]
    contributions: Vec<ContributionSpec>,
    #[serde(default)]
    token_balances: Vec<BalanceSpec>,
    #[serde(default)]
    windows: Vec<WindowSpec>,
}

#[derive(Debug, Deserialize)]
struct VentureSpec {
    id: String,
    owner_id: String,
    owner_min_pct: f64,
    alice_cap_pct: f64,
    reserve_pct: f64,
}

#[derive(Debug, Deserialize)]
struct GenesisSpec {
    holder_id: String,
    holder_type: HolderType,
    pct: f64,
}

#[derive(Debug, Deserialize)]
struct ContributionSpec {
    id: String,
    contributor_id: String,
    effort: f64,
    impact: f64,
    quality: f64,
    accepted_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct BalanceSpec {
    holder_id: String,
    balance: i64,
}

#[derive(Debug, Deserialize)]
struct WindowSpec {
    opens_at: DateTime<Utc>,
    closes_at: DateTime<Utc>,
    equity_rate_bps: u32,
    #[serde(default)]
    eligibility: Option<Rule>,
}

#[derive(Debug, Serialize)]
struct InitSummary {
    venture_id: String,
    holders: usize,
    contributions: usize,
    token_balances: usize,
    windows: usize,
}

// =============================================================================
// WIRING
// =============================================================================

struct Engine {
    repo: Arc<dyn LedgerRepository>,
    ledger: CapTableLedger,
    windows: ConversionWindowManager,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
}

impl Engine {
    fn build(cfg: &EngineConfig) -> Result<Self> {
        let repo: Arc<dyn LedgerRepository> = Arc::new(
            SqliteLedgerRepository::open(&cfg.storage.db_path)
                .with_context(|| format!("opening ledger database {}", cfg.storage.db_path))?,
        );
        let events: Arc<dyn EventSink> = Arc::new(BroadcastEventSink::default());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let ledger = CapTableLedger::new(repo.clone(), events.clone(), cfg.ledger.clone());
        let mut scorer = ContributionScorer::new(repo.clone());
        if let Some(rule) = &cfg.scoring.contribution_rule {
            scorer = scorer
                .with_filter(rule.clone())
                .context("invalid scoring.contribution_rule")?;
        }
        let engine = RebalancingEngine::new(
            ledger.clone(),
            scorer,
            events.clone(),
            cfg.rebalancing.clone(),
        );
        let windows =
            ConversionWindowManager::new(ledger.clone(), events.clone(), cfg.conversion.clone());
        let scheduler = Scheduler::new(clock.clone(), engine, windows.clone(), events, cfg);

        Ok(Self {
            repo,
            ledger,
            windows,
            scheduler,
            clock,
        })
    }

    fn ctx(&self) -> OpContext {
        OpContext::new("cli", self.clock.now())
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            let mut cfg = EngineConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?;
            cfg.apply_env_overrides();
            Ok(cfg)
        }
        None => Ok(EngineConfig::from_env()),
    }
}

/// Flip the returned receiver to `true` on ctrl-c.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received, stopping after in-flight work");
            let _ = tx.send(true);
        }
    });
    rx
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// COMMANDS
// =============================================================================

async fn init_venture(engine: &Engine, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let spec: VentureFile =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;

    let ctx = engine.ctx();
    let venture_id = spec.venture.id.clone();
    let venture = Venture {
        id: spec.venture.id,
        owner_id: spec.venture.owner_id,
        owner_min_pct: to_pct(spec.venture.owner_min_pct),
        alice_cap_pct: to_pct(spec.venture.alice_cap_pct),
        reserve_pct: to_pct(spec.venture.reserve_pct),
        flagged_for_review: false,
        flag_reason: None,
        created_at: ctx.now,
    };
    let genesis: Vec<GenesisAllocation> = spec
        .genesis
        .iter()
        .map(|g| GenesisAllocation {
            holder_id: g.holder_id.clone(),
            holder_type: g.holder_type,
            pct: to_pct(g.pct),
        })
        .collect();
    engine.ledger.create_venture(&ctx, venture, &genesis).await?;

    for c in &spec.contributions {
        engine
            .repo
            .insert_contribution(&Contribution {
                id: c.id.clone(),
                contributor_id: c.contributor_id.clone(),
                venture_id: venture_id.clone(),
                effort: c.effort,
                impact: c.impact,
                quality: c.quality,
                status: ContributionStatus::Approved,
                accepted_at: Some(c.accepted_at),
            })
            .await
            .with_context(|| format!("inserting contribution {}", c.id))?;
    }
    for b in &spec.token_balances {
        engine
            .repo
            .upsert_token_balance(&TokenBalance {
                venture_id: venture_id.clone(),
                holder_id: b.holder_id.clone(),
                balance: b.balance,
                as_of: ctx.now,
            })
            .await?;
    }
    for w in &spec.windows {
        let mut window =
            ConversionWindow::new(&venture_id, w.opens_at, w.closes_at, w.equity_rate_bps);
        window.eligibility = w.eligibility.clone();
        engine.windows.schedule_window(&ctx, window).await?;
    }

    print_json(&InitSummary {
        venture_id,
        holders: genesis.len(),
        contributions: spec.contributions.len(),
        token_balances: spec.token_balances.len(),
        windows: spec.windows.len(),
    })
}

async fn rebalance(
    engine: &Engine,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    venture: Option<String>,
) -> Result<()> {
    let recovered = engine.scheduler.recover().await?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "resolved interrupted periods");
    }

    let cancel = cancel_on_ctrl_c();
    let report = match venture {
        Some(id) => {
            engine
                .scheduler
                .run_rebalancing_for(vec![id], start, end, cancel)
                .await
        }
        None => engine
            .scheduler
            .run_rebalancing_batch(start, end, cancel)
            .await?,
    };
    print_json(&report)
}

async fn reconcile(engine: &Engine, venture: Option<String>) -> Result<()> {
    let auditor = engine.ledger.auditor();
    let ctx = engine.ctx();
    let reports = match venture {
        Some(id) => vec![auditor.reconcile(&ctx, &id).await?],
        None => auditor.reconcile_all(&ctx).await?,
    };
    let inconsistent = reports.iter().filter(|r| !r.is_consistent()).count();
    print_json(&reports)?;
    anyhow::ensure!(inconsistent == 0, "{} venture(s) failed reconciliation", inconsistent);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;
    let engine = Engine::build(&cfg)?;

    match cli.command {
        Commands::InitVenture { file } => init_venture(&engine, &file).await,
        Commands::CapTable { venture } => {
            let entries = engine.ledger.get_cap_table(&venture).await?;
            print_json(&entries)
        }
        Commands::Rebalance {
            start,
            end,
            venture,
        } => rebalance(&engine, start, end, venture).await,
        Commands::Tick => {
            let report = engine.scheduler.tick_windows().await?;
            print_json(&report)
        }
        Commands::Reconcile { venture } => reconcile(&engine, venture).await,
        Commands::Daemon { tick_secs } => {
            let cancel = cancel_on_ctrl_c();
            engine
                .scheduler
                .run_daemon(Duration::from_secs(tick_secs.max(1)), cancel)
                .await?;
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "captable_engine=info,captable=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv();

    // also the crate root, for runs from another cwd
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
