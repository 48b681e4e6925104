//! docflow Admin CLI
//!
//! Local maintenance tool: process a single PDF end to end without the HTTP
//! server, resume runs left `running` in a state directory, and inspect runs.
//!
//! State directory layout:
//!
//! ```text
//! <state-dir>/runs/<run_id>.json   run state (JsonFileRunStore)
//! <state-dir>/documents.json       Document Record snapshot (JsonFileDocumentStore)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use colored::Colorize;
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use docflow::engine::tools::FileFetcher;
use docflow::engine::{JsonFileRunStore, RunStore};
use docflow::llm::openai::OpenAICompatibleClient;
use docflow::{
    DocumentEvent, DocumentRecord, DocumentStore, JsonFileDocumentStore, PipelineConfig,
    PipelineError, RunState, RunStatus, StageOutcome, WorkflowEngine,
};

const DOCUMENTS_FILE: &str = "documents.json";

#[derive(Parser)]
#[command(name = "docflow-admin")]
#[command(about = "docflow Admin CLI - run and inspect document pipeline runs")]
#[command(version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./docflow.toml when present)
    #[arg(short, long, env = "DOCFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory holding run state and the document snapshot
    #[arg(long, env = "DOCFLOW_STATE_DIR", default_value = ".docflow", global = true)]
    state_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one document through the pipeline and print the result
    Process {
        /// Local PDF path or http(s) URL
        source: String,

        /// Document id (generated when omitted)
        #[arg(long)]
        document_id: Option<String>,

        /// Owning user id
        #[arg(long, default_value = "local")]
        user_id: String,
    },

    /// Drive every run still marked running to completion
    Resume,

    /// Show a run, or list all runs when no id is given
    ShowRun {
        run_id: Option<Uuid>,

        /// Print the raw run state as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Reads `file://` URLs from disk and delegates everything else to HTTP
struct LocalOrHttpFetcher {
    http: docflow::engine::HttpFileFetcher,
}

#[async_trait]
impl FileFetcher for LocalOrHttpFetcher {
    async fn fetch(&self, url: &str) -> docflow::Result<Bytes> {
        let local = url::Url::parse(url)
            .ok()
            .filter(|parsed| parsed.scheme() == "file")
            .and_then(|parsed| parsed.to_file_path().ok());
        match local {
            Some(path) => tokio::fs::read(&path)
                .await
                .map(Bytes::from)
                .map_err(|e| PipelineError::Fetch(format!("{}: {}", path.display(), e))),
            None => self.http.fetch(url).await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let runs_dir = config
        .storage
        .runs_dir
        .clone()
        .unwrap_or_else(|| cli.state_dir.join("runs"));
    let runs: Arc<dyn RunStore> = Arc::new(JsonFileRunStore::open(&runs_dir).await?);
    let documents_file = config
        .storage
        .documents_file
        .clone()
        .unwrap_or_else(|| cli.state_dir.join(DOCUMENTS_FILE));
    let documents = Arc::new(JsonFileDocumentStore::open(&documents_file).await?);

    match cli.command {
        Commands::Process {
            source,
            document_id,
            user_id,
        } => {
            let engine = build_engine(&config, documents.clone(), runs)?;
            let run = process(&engine, &source, document_id, user_id).await?;
            print_run(&run, documents.as_ref()).await?;
        }

        Commands::Resume => {
            let engine = build_engine(&config, documents.clone(), runs)?;
            let outcomes = engine.drive_pending().await?;
            if outcomes.is_empty() {
                println!("{}", "No pending runs".dimmed());
            }
            for outcome in outcomes {
                match outcome {
                    Ok(run) => print_run(&run, documents.as_ref()).await?,
                    Err(e) => println!("{} {}", "✗".red(), e),
                }
            }
        }

        Commands::ShowRun { run_id, json } => match run_id {
            Some(run_id) => {
                let run = runs
                    .load(&run_id)
                    .await?
                    .with_context(|| format!("run {} not found", run_id))?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&run)?);
                } else {
                    print_run(&run, documents.as_ref()).await?;
                }
            }
            None => {
                let mut all = runs.list().await?;
                all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                for run in all {
                    println!(
                        "{}  {}  {}  {}",
                        run.run_id,
                        status_label(run.status),
                        run.payload.document_id,
                        run.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        },
    }

    Ok(())
}

fn build_engine(
    config: &PipelineConfig,
    documents: Arc<JsonFileDocumentStore>,
    runs: Arc<dyn RunStore>,
) -> Result<WorkflowEngine> {
    let engine_config = config.engine_config();
    let fetcher = LocalOrHttpFetcher {
        http: docflow::engine::HttpFileFetcher::new(engine_config.fetch_timeout)?,
    };
    let understanding = Arc::new(OpenAICompatibleClient::new(config.llm.clone())?);
    Ok(WorkflowEngine::builder(documents, understanding)
        .config(engine_config)
        .run_store(runs)
        .fetcher(Arc::new(fetcher))
        .build()?)
}

async fn process(
    engine: &WorkflowEngine,
    source: &str,
    document_id: Option<String>,
    user_id: String,
) -> Result<RunState> {
    let (file_url, file_name) = resolve_source(source)?;
    let document_id = document_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let documents = engine.documents();
    if documents.get_document(&document_id).await?.is_none() {
        documents
            .insert_document(DocumentRecord::pending(&document_id, &user_id))
            .await?;
    }

    let run = RunState::new(
        DocumentEvent::new(file_url, user_id, document_id.clone(), file_name),
        None,
    );
    engine.run_store().save(&run).await?;
    info!("Processing {} as document {}", source, document_id);
    Ok(engine.execute(run.run_id).await?)
}

/// Turn a CLI source argument into a fetchable URL and a display name
fn resolve_source(source: &str) -> Result<(String, String)> {
    if source.starts_with("http://") || source.starts_with("https://") {
        return Ok((source.to_string(), DocumentEvent::file_name_from_url(source)));
    }

    let path = std::fs::canonicalize(source).with_context(|| format!("reading {}", source))?;
    if !path.is_file() {
        bail!("{} is not a file", path.display());
    }
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "document.pdf".to_string());
    let url = url::Url::from_file_path(&path)
        .map_err(|_| anyhow::anyhow!("{} cannot be expressed as a file URL", path.display()))?;
    Ok((url.to_string(), name))
}

fn status_label(status: RunStatus) -> colored::ColoredString {
    match status {
        RunStatus::Running => status.as_str().yellow(),
        RunStatus::Completed => status.as_str().green(),
        RunStatus::Failed => status.as_str().red(),
    }
}

async fn print_run(run: &RunState, documents: &dyn DocumentStore) -> Result<()> {
    println!("{} {}", "Run".bold(), run.run_id);
    println!("  status:    {}", status_label(run.status));
    println!("  document:  {} ({})", run.payload.document_id, run.payload.file_name);
    println!("  stages:    {}", run.call_count);

    for invocation in &run.invocations {
        let mark = match &invocation.outcome {
            StageOutcome::Success(_) => "✓".green(),
            StageOutcome::Failure(_) => "✗".red(),
        };
        print!(
            "    {} {} attempt {} ({}ms)",
            mark, invocation.stage, invocation.attempt, invocation.duration_ms
        );
        match &invocation.outcome {
            StageOutcome::Failure(error) => println!(" {}", error.to_string().dimmed()),
            StageOutcome::Success(_) => println!(),
        }
    }

    if let Some(error) = &run.error {
        println!("  error:     {}", error.to_string().red());
    }

    match documents.get_document(&run.payload.document_id).await? {
        Some(record) => {
            println!("{} {}", "Document".bold(), record.id);
            println!("  status:    {}", record.status);
            if let Some(document_type) = record.document_type {
                println!("  type:      {}", document_type);
            }
            if !record.metadata.notes.is_empty() {
                println!("  notes:     {}", record.metadata.notes.yellow());
            }
            for entry in &record.content {
                println!("    {} = {}", entry.key.cyan(), entry.value);
            }
        }
        None => warn!("Document {} is not in the local snapshot", run.payload.document_id),
    }
    Ok(())
}
