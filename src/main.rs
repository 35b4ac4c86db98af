//! custody_sentinel - process entry point
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Chain   │───▶│ Scanner  │───▶│  Outbox  │───▶│ Notifier │───▶ ledger
//! │  (RPC)   │    │(classify)│    │ (durable)│    │ (retry)  │
//! └──────────┘    └────┬─────┘    └──────────┘    └──────────┘
//!                      │ Job::Drain
//!                      ▼
//!                 ┌──────────┐    ┌──────────┐
//!                 │ Job pool │◀───│Reconciler│ (periodic)
//!                 │ (drains) │    └──────────┘
//!                 └──────────┘
//! ```
//!
//! Usage: `custody_sentinel [--env <env>] [run | lookup <symbol> <txid> | status | reconcile]`

use anyhow::{Context, Result, bail};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use custody_sentinel::config::AppConfig;
use custody_sentinel::db::Database;
use custody_sentinel::sentinel::scheduler::RecordingScheduler;
use custody_sentinel::sentinel::{
    AddressRegistry, AssetRegistry, BalanceReconciler, BlockScanner, ChainClient, CursorStore,
    DrainOrchestrator, DryRunExecutor, EthRpcClient, HttpTransport, Job, JobRouter, JobScheduler,
    LockStore, MemoryRegistry, MemoryStore, Notifier, OutboxDispatcher, OutboxStore,
    PgAddressRegistry, PgStore, ShutdownSignal, TokioScheduler, TransactionLookup,
};

// ============================================================
// ARGUMENTS
// ============================================================

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Run,
    Lookup { symbol: String, txid: String },
    Status,
    Reconcile,
}

fn get_env(args: &[String]) -> String {
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn parse_mode(args: &[String]) -> Result<Mode> {
    let mut positional = Vec::new();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--env" || args[i] == "-e" {
            i += 2;
            continue;
        }
        positional.push(args[i].as_str());
        i += 1;
    }

    match positional.as_slice() {
        [] | ["run"] => Ok(Mode::Run),
        ["status"] => Ok(Mode::Status),
        ["reconcile"] => Ok(Mode::Reconcile),
        ["lookup", symbol, txid] => Ok(Mode::Lookup {
            symbol: symbol.to_string(),
            txid: txid.to_string(),
        }),
        other => bail!(
            "unrecognized arguments {:?}; usage: custody_sentinel [--env <env>] [run | lookup <symbol> <txid> | status | reconcile]",
            other
        ),
    }
}

// ============================================================
// WIRING
// ============================================================

struct Services {
    chain: Arc<dyn ChainClient>,
    registry: Arc<dyn AddressRegistry>,
    cursor: Arc<dyn CursorStore>,
    outbox: Arc<dyn OutboxStore>,
    locks: Arc<dyn LockStore>,
    assets: Arc<AssetRegistry>,
}

async fn build_services(config: &AppConfig) -> Result<Services> {
    let sentinel = &config.sentinel;
    let chain: Arc<dyn ChainClient> = Arc::new(EthRpcClient::new(&sentinel.chain)?);
    let assets = Arc::new(AssetRegistry::new(sentinel));

    match &config.postgres_url {
        Some(url) => {
            let db = Database::connect(url, &config.postgres_pool)
                .await
                .context("Failed to connect to PostgreSQL")?;
            db.health_check().await?;

            let store = Arc::new(PgStore::new(
                db.pool().clone(),
                Duration::from_secs(sentinel.drain.lock_ttl_secs),
            ));
            store.ensure_schema().await?;

            Ok(Services {
                chain,
                registry: Arc::new(PgAddressRegistry::new(db.pool().clone())),
                cursor: store.clone(),
                outbox: store.clone(),
                locks: store,
                assets,
            })
        }
        None => {
            warn!("No postgres_url configured, using in-memory stores and an empty registry");
            let store = Arc::new(MemoryStore::with_lock_ttl(Duration::from_secs(
                sentinel.drain.lock_ttl_secs,
            )));
            Ok(Services {
                chain,
                registry: Arc::new(MemoryRegistry::new()),
                cursor: store.clone(),
                outbox: store.clone(),
                locks: store,
                assets,
            })
        }
    }
}

fn drain_orchestrator(config: &AppConfig, services: &Services) -> Arc<DrainOrchestrator> {
    Arc::new(DrainOrchestrator::new(
        services.chain.clone(),
        services.assets.clone(),
        services.locks.clone(),
        Arc::new(DryRunExecutor),
        config.sentinel.drain.fee_deposit_account.clone(),
    ))
}

fn block_scanner(
    config: &AppConfig,
    services: &Services,
    scheduler: Arc<dyn JobScheduler>,
    shutdown: Arc<ShutdownSignal>,
) -> BlockScanner {
    BlockScanner::new(
        services.chain.clone(),
        services.registry.clone(),
        services.assets.clone(),
        services.cursor.clone(),
        services.outbox.clone(),
        scheduler,
        config.sentinel.scanning.clone(),
        Duration::from_millis(config.sentinel.service.poll_interval_ms),
        shutdown,
    )
}

// ============================================================
// MODES
// ============================================================

async fn run(config: &AppConfig, services: Services) -> Result<()> {
    let sentinel = &config.sentinel;
    let shutdown = Arc::new(ShutdownSignal::new());

    let (scheduler, jobs) = TokioScheduler::new(1024, shutdown.clone());
    let scheduler = Arc::new(scheduler);

    let transport = Arc::new(HttpTransport::new(&sentinel.notify)?);
    let notifier = Arc::new(Notifier::new(transport, &sentinel.notify, shutdown.clone()));

    warn!("Drain executor is dry-run; signing and broadcast are external");
    let drains = drain_orchestrator(config, &services);
    let reconciler = Arc::new(BalanceReconciler::new(
        services.chain.clone(),
        services.registry.clone(),
        services.assets.clone(),
        scheduler.clone(),
        sentinel,
    ));
    let router = Arc::new(JobRouter::new(drains, reconciler, notifier.clone()));

    let scanner = block_scanner(config, &services, scheduler.clone(), shutdown.clone());
    let dispatcher = OutboxDispatcher::new(
        services.outbox.clone(),
        notifier,
        sentinel.service.notify_concurrency,
        Duration::from_millis(sentinel.service.poll_interval_ms),
        shutdown.clone(),
    );

    scheduler
        .schedule_periodic(
            Job::RefreshBalances,
            Duration::from_secs(sentinel.service.reconcile_interval_secs),
        )
        .await?;

    let scanner_task = tokio::spawn(async move { scanner.run().await });
    let dispatcher_task = tokio::spawn(async move { dispatcher.run().await });
    let pool_task = tokio::spawn(TokioScheduler::run(
        jobs,
        router,
        sentinel.service.worker_concurrency,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    shutdown.request_shutdown();

    let (scanner, dispatcher, pool) = tokio::join!(scanner_task, dispatcher_task, pool_task);
    for (name, result) in [("scanner", scanner), ("dispatcher", dispatcher), ("job pool", pool)] {
        if let Err(e) = result {
            error!("{} task failed: {}", name, e);
        }
    }

    info!("custody_sentinel stopped");
    Ok(())
}

async fn lookup(services: Services, symbol: &str, txid: &str) -> Result<()> {
    let lookup = TransactionLookup::new(services.chain, services.registry, services.assets);
    let outcome = lookup.lookup(symbol, txid).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn status(config: &AppConfig, services: Services) -> Result<()> {
    let shutdown = Arc::new(ShutdownSignal::new());
    let (scheduler, _jobs) = TokioScheduler::new(1, shutdown.clone());
    let scanner = block_scanner(config, &services, Arc::new(scheduler), shutdown);

    let status = scanner.status().await?;
    let block_time = status
        .last_block_timestamp
        .and_then(|ts| chrono::DateTime::from_timestamp(ts as i64, 0))
        .map(|t| t.to_rfc3339());

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "last_block": status.last_block,
            "last_block_time": block_time,
            "head": status.head,
            "behind": status.last_block.map(|b| status.head.saturating_sub(b)),
        }))?
    );
    Ok(())
}

async fn reconcile(config: &AppConfig, services: Services) -> Result<()> {
    let requests = Arc::new(RecordingScheduler::new());
    let reconciler = BalanceReconciler::new(
        services.chain.clone(),
        services.registry.clone(),
        services.assets.clone(),
        requests.clone(),
        &config.sentinel,
    );

    let report = reconciler.refresh().await?;
    println!("{:?}", report);

    let drains = drain_orchestrator(config, &services);
    for (symbol, address) in requests.drains().await {
        match drains.drain(&symbol, &address).await {
            Ok(outcome) => println!("{} {}: {:?}", symbol, address, outcome),
            Err(e) => println!("{} {}: failed: {}", symbol, address, e),
        }
    }
    Ok(())
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let env = get_env(&args);
    let mode = parse_mode(&args)?;

    let app_config = AppConfig::load(&env)?;
    let _log_guard = custody_sentinel::logging::init_logging(&app_config);

    info!(
        "Starting custody_sentinel {} ({} env, {:?})",
        env!("GIT_HASH"),
        env,
        mode
    );

    let services = build_services(&app_config).await?;

    match mode {
        Mode::Run => run(&app_config, services).await,
        Mode::Lookup { symbol, txid } => lookup(services, &symbol, &txid).await,
        Mode::Status => status(&app_config, services).await,
        Mode::Reconcile => reconcile(&app_config, services).await,
    }
}
