#![forbid(unsafe_code)]

//! **cadre-cli** – Command-line interface for Cadre.
//!
//! Runs the long-lived services (orchestrator, workers, validator) against
//! the configured substrate and offers producer commands for exercising a
//! deployment: submitting intake requests, answering open questions and
//! inspecting the backlog.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cadre_agent_runtime::{HeuristicAnalyst, WorkerHarness};
use cadre_orchestration::Orchestrator;
use cadre_runtime::{RuntimeConfig, Validator};
use cadre_schema::SchemaRegistry;
use cadre_state::{BacklogStore, QuestionStore};
use cadre_store_core::Substrate;
use cadre_store_redis::RedisSubstrate;
use cadre_types::{AnswerSubmitted, EventEnvelope, EventPayload, InitialRequest};

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "cadre")]
#[command(about = "Cadre - event-driven workflow runtime CLI")]
#[command(version)]
struct Cli {
    /// Directory holding the contract schemas
    #[arg(long, default_value = "schemas")]
    schemas: String,

    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator service
    Orchestrator,
    /// Run a worker for one agent target
    Worker {
        /// Agent target to serve (e.g. cost_analyst)
        #[arg(long)]
        target: String,
        /// Consumer name within the target's group
        #[arg(long, default_value = "worker-1")]
        consumer: String,
    },
    /// Run the contract validator service
    Validator,
    /// Publish an intake request
    Submit {
        /// Project to open
        #[arg(long)]
        project_id: String,
        /// Free-form request text
        #[arg(long)]
        request_text: String,
    },
    /// Publish an answer to an open question
    Answer {
        /// Owning project
        #[arg(long)]
        project_id: String,
        /// Question being answered
        #[arg(long)]
        question_id: String,
        /// Answer value (JSON accepted, plain text otherwise)
        #[arg(long)]
        answer: String,
    },
    /// Show backlog state for a project (or all projects)
    Backlog {
        /// Project to inspect
        #[arg(long)]
        project_id: Option<String>,
    },
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let config = RuntimeConfig::from_env();
    info!(
        stream = %config.stream,
        redis_url = %config.redis_url,
        "starting cadre v{}",
        env!("CARGO_PKG_VERSION")
    );

    let substrate: Arc<dyn Substrate> = Arc::new(
        RedisSubstrate::connect(&config.redis_url)
            .await
            .context("substrate connection failed")?,
    );

    match cli.command {
        Commands::Orchestrator => {
            let registry = load_registry(&cli.schemas)?;
            let orchestrator = Arc::new(Orchestrator::new(substrate, &config));
            let consumer = orchestrator.into_consumer(registry, &config);
            consumer.run(shutdown_token()).await
        }
        Commands::Worker { target, consumer } => {
            let registry = load_registry(&cli.schemas)?;
            let harness = Arc::new(WorkerHarness::new(
                substrate,
                Arc::new(HeuristicAnalyst::new(target)),
                &config,
            ));
            let worker = harness.into_consumer(registry, &config, &consumer);
            worker.run(shutdown_token()).await
        }
        Commands::Validator => {
            let registry = load_registry(&cli.schemas)?;
            let validator = Validator::new(substrate, registry, &config);
            validator.run(shutdown_token()).await
        }
        Commands::Submit {
            project_id,
            request_text,
        } => {
            let envelope = EventEnvelope::build(
                &EventPayload::InitialRequestReceived(InitialRequest {
                    project_id,
                    request_text,
                }),
                "cadre-cli",
            );
            substrate
                .append(&config.stream, &envelope.to_wire_fields())
                .await?;
            println!("submitted {} (correlation {})", envelope.event_id, envelope.correlation_id);
            Ok(())
        }
        Commands::Answer {
            project_id,
            question_id,
            answer,
        } => {
            // Accept structured answers, fall back to plain text.
            let value = serde_json::from_str(&answer)
                .unwrap_or(serde_json::Value::String(answer));
            let envelope = EventEnvelope::build(
                &EventPayload::AnswerSubmitted(AnswerSubmitted {
                    project_id,
                    question_id,
                    answer: value,
                }),
                "cadre-cli",
            );
            substrate
                .append(&config.stream, &envelope.to_wire_fields())
                .await?;
            println!("answered with event {}", envelope.event_id);
            Ok(())
        }
        Commands::Backlog { project_id } => {
            show_backlog(substrate, &config, project_id.as_deref()).await
        }
    }
}

//─────────────────────────────
//  Helpers
//─────────────────────────────

fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn load_registry(dir: &str) -> Result<Arc<SchemaRegistry>> {
    Ok(Arc::new(
        SchemaRegistry::load(dir).context("loading contract schemas")?,
    ))
}

/// Token cancelled on Ctrl-C so consumer loops drain and exit.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal.cancel();
        }
    });
    cancel
}

async fn show_backlog(
    substrate: Arc<dyn Substrate>,
    config: &RuntimeConfig,
    project_id: Option<&str>,
) -> Result<()> {
    let backlog = BacklogStore::new(substrate.clone(), config.keyspace());
    let questions = QuestionStore::new(substrate, config.keyspace());

    let projects = match project_id {
        Some(project) => vec![project.to_string()],
        None => backlog.list_project_ids().await?,
    };
    for project in projects {
        println!("project {project}");
        for item_id in backlog.list_item_ids(&project).await? {
            let item = backlog.require(&project, &item_id).await?;
            println!(
                "  {item_id}  {:<12} {:?} {}",
                item.status.to_string(),
                item.item_type,
                item.agent_target.as_deref().unwrap_or("-"),
            );
        }
        let open = questions.list_open(&project).await?;
        for question_id in open {
            let question = questions.require(&project, &question_id).await?;
            println!("  open question {question_id}: {}", question.question_text);
        }
    }
    Ok(())
}
