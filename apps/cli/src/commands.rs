//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinSet;
use tracing::{info, warn};

use notescrawl_crawler::{
    CrawlWorker, QueueStore, RepositoryClient, SnapshotRepository, StorageQueue, WorkSignal,
    WorkerStats,
};
use notescrawl_shared::{
    AppConfig, CrawlPolicy, CrawlRecord, CrawlState, expand_home, init_config, load_config,
    load_config_from,
};
use notescrawl_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// notescrawl: crawl repository documents into normalized, index-ready records.
#[derive(Parser)]
#[command(
    name = "notescrawl",
    version,
    about = "Crawl repository documents and their attachments into normalized records.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.notescrawl/notescrawl.toml).
    #[arg(long, global = true, env = "NOTESCRAWL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Queue database (overrides `connector.store_path`).
    #[arg(long, global = true, env = "NOTESCRAWL_STORE")]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run crawl workers against a repository snapshot.
    Run {
        /// Repository snapshot (JSON export) to crawl from.
        #[arg(long)]
        snapshot: PathBuf,

        /// Number of workers (defaults to `connector.workers`).
        #[arg(short, long)]
        workers: Option<u32>,

        /// Stop once the queue is empty instead of waiting for more work.
        #[arg(long)]
        until_empty: bool,
    },

    /// Queue documents for crawling.
    Enqueue {
        /// Template configuration to crawl with.
        #[arg(short, long)]
        template: String,

        /// Authentication type of the source database ("none" makes documents public).
        #[arg(long, default_value = "basic")]
        auth_type: String,

        /// Queue every document of this snapshot.
        #[arg(long, conflicts_with_all = ["server", "replica_id", "unid"])]
        snapshot: Option<PathBuf>,

        /// Server holding the source database.
        #[arg(long, required_unless_present = "snapshot")]
        server: Option<String>,

        /// Replica id of the source database.
        #[arg(long, required_unless_present = "snapshot")]
        replica_id: Option<String>,

        /// Universal id of the document.
        #[arg(long, required_unless_present = "snapshot")]
        unid: Option<String>,
    },

    /// Show queue counts per state, optionally listing records.
    Status {
        /// List records in this state (queued, incrawl, fetched, error).
        #[arg(long)]
        state: Option<CrawlState>,

        /// Maximum records to list.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Print one crawl record as JSON.
    Show {
        /// Record id.
        id: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "notescrawl=info",
        1 => "notescrawl=debug",
        _ => "notescrawl=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(cli.config.as_deref()).await,
        };
    }

    let config = match cli.config.as_deref() {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let store_path = cli
        .store
        .clone()
        .unwrap_or_else(|| expand_home(&config.connector.store_path));

    match cli.command {
        Command::Run {
            snapshot,
            workers,
            until_empty,
        } => cmd_run(&config, &store_path, &snapshot, workers, until_empty).await,
        Command::Enqueue {
            template,
            auth_type,
            snapshot,
            server,
            replica_id,
            unid,
        } => {
            let targets = match snapshot {
                Some(path) => SnapshotRepository::load(&path)?
                    .documents()
                    .into_iter()
                    .map(|d| (d.server, d.replica_id, d.unid))
                    .collect(),
                None => match (server, replica_id, unid) {
                    (Some(server), Some(replica_id), Some(unid)) => {
                        vec![(server, replica_id, unid)]
                    }
                    _ => return Err(eyre!("--server, --replica-id and --unid are required")),
                },
            };
            cmd_enqueue(&config, &store_path, &template, &auth_type, targets).await
        }
        Command::Status { state, limit } => cmd_status(&store_path, state, limit).await,
        Command::Show { id } => cmd_show(&store_path, &id).await,
        Command::Config { .. } => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: &AppConfig,
    store_path: &Path,
    snapshot: &Path,
    workers: Option<u32>,
    until_empty: bool,
) -> Result<()> {
    let storage = Storage::open(store_path).await?;
    seed_templates(&storage, config).await?;
    let store_id = storage.store_id().await?;
    drop(storage);

    let snapshot_repo = SnapshotRepository::load(snapshot)?;
    let repository: Arc<dyn RepositoryClient> = Arc::new(snapshot_repo.clone());
    let store: Arc<dyn QueueStore> = Arc::new(StorageQueue::new(store_path));
    let policy = Arc::new(CrawlPolicy::from(config));
    let signal = Arc::new(WorkSignal::new(policy.idle_poll));
    let count = workers.unwrap_or(config.connector.workers).max(1);

    info!(
        store = %store_path.display(),
        store_id = %store_id,
        workers = count,
        until_empty,
        "starting crawl workers"
    );

    let mut tasks = JoinSet::new();
    for n in 0..count {
        let worker = CrawlWorker::new(
            format!("crawler-{n}"),
            repository.clone(),
            store.clone(),
            policy.clone(),
            signal.clone(),
        );
        if until_empty {
            tasks.spawn(worker.drain());
        } else {
            tasks.spawn(worker.run());
        }
    }

    let shutdown = signal.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, waiting for workers to finish");
            shutdown.shutdown();
        }
    });

    let progress = CliProgress::new()?;
    progress.message(format!("Crawling with {count} worker(s)"));

    let mut total = WorkerStats::default();
    let mut finished = 0;
    while let Some(joined) = tasks.join_next().await {
        let stats = joined.map_err(|e| eyre!("crawl worker panicked: {e}"))?;
        total.merge(&stats);
        finished += 1;
        progress.message(format!("{finished}/{count} workers finished"));
    }
    progress.finish();

    if snapshot_repo.active_sessions() > 0 {
        warn!(
            sessions = snapshot_repo.active_sessions(),
            "repository sessions left open"
        );
    }

    println!();
    println!("  Crawl finished.");
    println!("  Processed:    {}", total.processed);
    println!("  Fetched:      {}", total.fetched);
    println!("  Errors:       {}", total.errors);
    println!("  Failures:     {}", total.failures);
    println!("  Backpressure: {}", total.backpressure);
    println!();

    Ok(())
}

async fn cmd_enqueue(
    config: &AppConfig,
    store_path: &Path,
    template: &str,
    auth_type: &str,
    targets: Vec<(String, String, String)>,
) -> Result<()> {
    let storage = Storage::open(store_path).await?;
    seed_templates(&storage, config).await?;

    if storage.get_template(template).await?.is_none() {
        warn!(template, "template is not configured; records will fail until it is");
    }

    let mut queued = 0;
    for (server, replica_id, unid) in targets {
        let mut record = CrawlRecord::request(server, replica_id, unid, template);
        record.auth_type = auth_type.to_string();
        storage.insert_record(&record).await?;
        info!(id = %record.id, unid = %record.unid, "queued crawl request");
        queued += 1;
    }

    println!("Queued {queued} document(s) with template '{template}'.");
    Ok(())
}

async fn cmd_status(store_path: &Path, state: Option<CrawlState>, limit: u32) -> Result<()> {
    let storage = Storage::open_readonly(store_path).await?;

    println!("  Store:  {}", storage.store_id().await?);
    println!("  Path:   {}", store_path.display());
    println!();

    let counts = storage.count_by_state().await?;
    if counts.is_empty() {
        println!("  Queue is empty.");
    }
    for (state, count) in &counts {
        println!("  {:<10} {count}", state.as_str());
    }

    if let Some(state) = state {
        println!();
        for record in storage.list_records(Some(state), limit).await? {
            let target = if record.doc_id.is_empty() {
                format!("{}/{}", record.replica_id, record.unid)
            } else {
                record.doc_id.clone()
            };
            println!(
                "  {}  {:<6}  {target}  {}",
                record.id,
                record.action.as_str(),
                record.title
            );
        }
    }

    Ok(())
}

async fn cmd_show(store_path: &Path, id: &str) -> Result<()> {
    let storage = Storage::open_readonly(store_path).await?;
    let record = storage
        .get_record(id)
        .await?
        .ok_or_else(|| eyre!("no crawl record with id '{id}'"))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config: AppConfig = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

/// Write every configured template into the queue store.
async fn seed_templates(storage: &Storage, config: &AppConfig) -> Result<()> {
    for template in &config.templates {
        storage.upsert_template(template).await?;
        info!(template = %template.name, "template configuration stored");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Spinner shown while workers run.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Result<Self> {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")?
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Ok(Self { spinner })
    }

    fn message(&self, msg: String) {
        self.spinner.set_message(msg);
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}
