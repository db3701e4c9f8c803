#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cityxlink::cache::SqliteIdentifierCache;
use cityxlink::config::{load_config, XlinkConfig};
use cityxlink::events::EventSink;
use cityxlink::pool::ErrorSlot;
use cityxlink::resolver::{IdentifierResolver, ResolverManager};
use cityxlink::storage::SqliteStorage;
use cityxlink::{ReferenceSplitter, XlinkError};

#[derive(Parser)]
#[command(name = "cityxlink")]
#[command(
    about = "Resolve deferred CityGML XLinks in an imported city database",
    long_about = None
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database file (overrides [store] path)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Configuration file (defaults to <config dir>/cityxlink/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level filter (e.g. debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the store schema
    Migrate,

    /// Resolve every pending reference in the staging queues
    Resolve {
        /// Number of resolver workers
        #[arg(long)]
        workers: Option<usize>,
        /// Directory relative texture and world-file paths are read from
        #[arg(long)]
        import_dir: Option<PathBuf>,
    },

    /// Show pending rows per staging queue
    Status,
}

fn init_tracing(log_level: &str) {
    // JSON by default, plain text with CITYXLINK_LOG_TEXT=1
    let text_logging = std::env::var("CITYXLINK_LOG_TEXT")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("cityxlink={}", log_level).into());

    if text_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("cityxlink-worker")
        .enable_all()
        .build()?;

    let outcome = rt.block_on(run(cli));

    if let Err(e) = outcome {
        tracing::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), XlinkError> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(database) = &cli.database {
        config.store.path = database.to_string_lossy().into_owned();
    }

    match cli.command {
        Commands::Migrate => handle_migrate(&config).await,
        Commands::Resolve {
            workers,
            import_dir,
        } => {
            if let Some(workers) = workers {
                config.resolver.workers = workers;
            }
            if import_dir.is_some() {
                config.resolver.import_dir = import_dir;
            }
            config.resolver.validate()?;
            handle_resolve(config).await
        }
        Commands::Status => handle_status(&config).await,
    }
}

async fn open_store(config: &XlinkConfig) -> Result<SqliteStorage, XlinkError> {
    let storage = SqliteStorage::connect(&config.store.path, config.store.max_connections).await?;
    storage.health_check().await?;
    Ok(storage)
}

// === CLI handlers ===

async fn handle_migrate(config: &XlinkConfig) -> Result<(), XlinkError> {
    let storage = open_store(config).await?;
    storage.migrate().await?;
    println!("Schema up to date: {}", config.store.path);
    storage.close().await;
    Ok(())
}

async fn handle_resolve(config: XlinkConfig) -> Result<(), XlinkError> {
    let storage = open_store(&config).await?;
    storage.migrate().await?;

    let resolver_config = config.resolver.clone();
    let cache = Arc::new(SqliteIdentifierCache::new(
        storage.clone(),
        resolver_config.cache_capacity_bytes,
    ));
    let identifiers = Arc::new(IdentifierResolver::new(
        cache,
        storage.clone(),
        resolver_config.max_indirection_depth,
    ));
    let manager = Arc::new(
        ResolverManager::new(
            storage.clone(),
            identifiers,
            resolver_config,
            EventSink::default(),
            ErrorSlot::new(),
        )
        .await?,
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping after in-flight references");
            ctrl_c.cancel();
        }
    });

    let splitter = ReferenceSplitter::new(manager, cancel);
    let result = splitter.run().await;

    let (queries, slow, total_ms) = storage.metrics().get_stats();
    tracing::info!(
        "Store: {} queries, {} slow, {} ms total",
        queries,
        slow,
        total_ms
    );
    storage.close().await;

    let result = result?;
    let report = json!({
        "status": result.status(),
        "result": result,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(anyhow::Error::from)?
    );
    Ok(())
}

async fn handle_status(config: &XlinkConfig) -> Result<(), XlinkError> {
    let storage = open_store(config).await?;
    storage.migrate().await?;
    let counts = storage.pending_counts().await?;
    storage.close().await;

    let total: i64 = counts.values().sum();
    println!("Store: {}", config.store.path);
    for (kind, count) in &counts {
        println!("  {:<22} {}", kind.staging_table(), count);
    }
    println!("Pending references: {}", total);
    Ok(())
}
