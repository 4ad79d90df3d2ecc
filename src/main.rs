//! docgen-batch 命令行入口
//!
//! 扫描工作区、批量生成文档，并提供已生成文档的查询与删除。

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docgen_batch::config::{load_config, save_config, AppConfig, DEFAULT_CONFIG_FILE};
use docgen_batch::error::AppError;
use docgen_batch::llm::LlmClient;
use docgen_batch::services::batch::{
    BatchRun, BatchScheduler, BatchSummary, Dispatcher, DocumentId, DocumentStore,
    FingerprintCache, FsDocumentStore, LogObserver, PriceTable, RetryPolicy, ScanOptions,
    TemplateRegistry, WorkspaceScanner,
};
use docgen_batch::utils::AttemptLog;

/// 在 Windows 上设置控制台代码页为 UTF-8
#[cfg(windows)]
fn setup_console_encoding() {
    unsafe {
        extern "system" {
            fn SetConsoleOutputCP(code_page: u32) -> i32;
        }
        SetConsoleOutputCP(65001);
    }
}

#[cfg(not(windows))]
fn setup_console_encoding() {}

#[derive(Parser)]
#[clap(
    name = "docgen-batch",
    version,
    about = "Generate AI documentation for every source file in a workspace"
)]
struct Cli {
    /// Path to the JSON config file (defaults to ./docgen.json when present)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a workspace and generate documentation for changed files
    Run {
        /// Workspace root to scan
        workspace: PathBuf,
        /// Number of workers (overrides config)
        #[clap(long)]
        workers: Option<usize>,
        /// Maximum in-flight upstream requests (overrides config)
        #[clap(long)]
        dispatch_limit: Option<usize>,
        /// Model name (overrides config)
        #[clap(long)]
        model: Option<String>,
    },
    /// Print a stored document
    Show { doc_id: String },
    /// List documents generated for a source file, newest first
    List { file_path: PathBuf },
    /// Delete a stored document and forget its fingerprint
    Delete { doc_id: String },
    /// Show the most recent upstream attempts
    Attempts {
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },
    /// Write a config file with default values
    Init {
        #[clap(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_console_encoding();

    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docgen_batch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Commands::Init { path } = &cli.command {
        return init_config(path);
    }

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            workspace,
            workers,
            dispatch_limit,
            model,
        } => {
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(limit) = dispatch_limit {
                config.dispatch_limit = limit;
            }
            if let Some(model) = model {
                config.model = model;
            }
            config.validate()?;

            let run = run_workspace(&config, &workspace).await?;
            if run.aborted.is_some() {
                std::process::exit(2);
            }
        }
        Commands::Show { doc_id } => {
            let store = FsDocumentStore::open(config.documents_dir()).await?;
            let doc = store.get(&parse_doc_id(&doc_id)?).await?;
            println!("# {} ({})", doc.file_path.display(), doc.document_id);
            println!(
                "model={} tokens={}+{} template={} created={}",
                doc.metadata.model,
                doc.metadata.prompt_tokens,
                doc.metadata.completion_tokens,
                doc.metadata.template_version,
                doc.metadata.created_at.to_rfc3339()
            );
            println!();
            println!("{}", doc.content);
        }
        Commands::List { file_path } => {
            let store = FsDocumentStore::open(config.documents_dir()).await?;
            let docs = store.list_by_path(&file_path).await?;
            if docs.is_empty() {
                println!("No documents for {}", file_path.display());
            }
            for doc in docs {
                println!(
                    "{}  {}  {}  {}",
                    doc.document_id,
                    doc.metadata.created_at.format("%Y-%m-%d %H:%M:%S"),
                    doc.output_format,
                    doc.metadata.model
                );
            }
        }
        Commands::Delete { doc_id } => {
            let id = parse_doc_id(&doc_id)?;
            let store = FsDocumentStore::open(config.documents_dir()).await?;
            if !store.delete(&id).await? {
                bail!("document {} not found", id);
            }
            let index = config.fingerprint_index_path();
            let cache = FingerprintCache::load(&index).await?;
            let forgotten = cache.forget_document(&id);
            cache.save(&index).await?;
            println!("Deleted {} ({} fingerprint entries removed)", id, forgotten);
        }
        Commands::Attempts { limit } => {
            let log = AttemptLog::new(config.attempt_log_path(), config.attempt_log_max_entries);
            for record in log.tail(limit) {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Commands::Init { .. } => {}
    }

    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    save_config(&AppConfig::default(), path)?;
    println!("Config written to {}", path.display());
    Ok(())
}

fn parse_doc_id(value: &str) -> Result<DocumentId> {
    DocumentId::parse(value).ok_or_else(|| anyhow!("invalid document id: {}", value))
}

async fn run_workspace(config: &AppConfig, workspace: &Path) -> Result<BatchRun> {
    let units = WorkspaceScanner::new(ScanOptions::from_config(config)).scan(workspace)?;

    let store: Arc<dyn DocumentStore> = Arc::new(FsDocumentStore::open(config.documents_dir()).await?);
    let index = config.fingerprint_index_path();
    let cache = Arc::new(FingerprintCache::load(&index).await?);
    cache.prune_missing(store.as_ref()).await?;

    let client = LlmClient::new(
        &config.api_key,
        &config.base_url,
        Duration::from_secs(config.request_timeout_secs),
    )?;
    let templates = TemplateRegistry::with_overrides(&config.template_overrides)
        .map_err(|e| AppError::Config(e.to_string()))?;
    let attempt_log = Arc::new(AttemptLog::new(
        config.attempt_log_path(),
        config.attempt_log_max_entries,
    ));

    let scheduler = BatchScheduler::new(
        Dispatcher::new(Arc::new(client), config.dispatch_limit),
        cache.clone(),
        store,
        templates,
    )
    .with_retry(RetryPolicy::new(config.retry.clone()))
    .with_prices(PriceTable::new(config.pricing.clone()))
    .with_template_version(config.template_version.clone())
    .with_store_outage_threshold(config.store_outage_threshold)
    .with_observer(Arc::new(LogObserver))
    .with_attempt_log(attempt_log);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, letting in-flight requests finish");
                cancel.cancel();
            }
        });
    }

    let run = scheduler
        .run(units, config.workers, &config.model_config(), cancel)
        .await;

    cache.save(&index).await?;
    let summary_path = BatchSummary::new(&run, config.model.clone())
        .write_to(&config.batches_dir())
        .await?;
    info!("Batch summary written to {}", summary_path.display());

    print_report(&run);
    Ok(run)
}

fn print_report(run: &BatchRun) {
    let report = &run.report;
    println!();
    println!("Processed  {}/{}", report.processed, report.total);
    println!("Succeeded  {}", report.succeeded);
    println!("Failed     {}", report.failed);
    println!("Skipped    {}", report.skipped);
    println!(
        "Tokens     {} ({} prompt / {} completion)",
        report.total_tokens, report.prompt_tokens, report.completion_tokens
    );
    println!("Cost       {}", report.estimated_cost);
    println!("Elapsed    {:.1}s", report.elapsed.as_secs_f64());
    for (kind, count) in &report.failures {
        println!("  {:<22} {}", kind, count);
    }
    if let Some(reason) = run.aborted {
        println!("Aborted    {}", reason);
    }
}
