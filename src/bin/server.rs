// docflow - HTTP trigger server
// Run with: cargo run --bin server -- --config docflow.toml

//! # docflow Server Binary
//!
//! Wires the configured stores, the text-understanding client and the
//! workflow engine together, then serves the HTTP trigger surface. Runs left
//! unfinished by a previous process are resumed only when Document Records
//! are durable too (`storage.documents_file`).
//!
//! ```text
//! main()
//!   ↓ loads PipelineConfig (docflow.toml + DOCFLOW__* + .env)
//! WorkflowEngine + EventTrigger
//!   ↓ resume_pending()
//! DocflowServer (axum)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use docflow::engine::{InMemoryRunStore, JsonFileRunStore, RunStore};
use docflow::llm::openai::OpenAICompatibleClient;
use docflow::server::DocflowServer;
use docflow::{
    DocumentStore, EventTrigger, InMemoryDocumentStore, JsonFileDocumentStore, PipelineConfig,
    WorkflowEngine,
};

#[derive(Parser)]
#[command(name = "docflow-server")]
#[command(about = "Serve the docflow event trigger over HTTP")]
struct Args {
    /// Config file (defaults to ./docflow.toml when present)
    #[arg(short, long, env = "DOCFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config =
        PipelineConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!("Starting docflow server");
    info!("Model: {} via {}", config.llm.model, config.llm.base_url);
    if config.llm.api_key.is_none() {
        warn!("No API key configured; text-understanding calls will likely be rejected");
    }

    let runs: Arc<dyn RunStore> = match &config.storage.runs_dir {
        Some(dir) => {
            info!("Run state directory: {}", dir.display());
            Arc::new(JsonFileRunStore::open(dir).await?)
        }
        None => {
            warn!("No runs_dir configured; run state will not survive a restart");
            Arc::new(InMemoryRunStore::new())
        }
    };

    let documents: Arc<dyn DocumentStore> = match &config.storage.documents_file {
        Some(path) => {
            info!("Document snapshot: {}", path.display());
            Arc::new(JsonFileDocumentStore::open(path).await?)
        }
        None => {
            warn!("No documents_file configured; document records will not survive a restart");
            Arc::new(InMemoryDocumentStore::new())
        }
    };
    let durable_documents = config.storage.documents_file.is_some();

    let understanding = Arc::new(OpenAICompatibleClient::new(config.llm.clone())?);
    let engine = WorkflowEngine::builder(documents, understanding)
        .config(config.engine_config())
        .run_store(runs)
        .build()?;

    let trigger = Arc::new(EventTrigger::new(engine.clone()));
    let known = trigger.load_history().await?;
    if durable_documents {
        let resumed = engine.resume_pending().await?;
        info!("{} known event(s), {} run(s) resumed", known, resumed.len());
    } else {
        // Pending runs point at records this process never saw
        let pending = engine.run_store().list_running().await?.len();
        if pending > 0 {
            warn!(
                "{} unfinished run(s) left as is; set storage.documents_file to resume them",
                pending
            );
        }
        info!("{} known event(s)", known);
    }

    DocflowServer::new(trigger)
        .with_config(config.server.clone())
        .run()
        .await
}
