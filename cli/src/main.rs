//! Codeloom CLI - incremental code indexing for RAG
//!
//! Single binary driving the ingestion engine: `ingest` runs the pipeline,
//! `normalize-embeddings` and `backfill-criticality` are maintenance passes
//! over the document store.

// CLI tools legitimately use print macros for user output
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgGroup, Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use codeloom_engine::{
    holder, normalize_embeddings, DocumentStore, Enricher, HttpDocumentStore, HttpEmbedder,
    HttpLlm, IngestError, IngestTarget, Pipeline, PipelineOptions, RunOutcome, RunStatus,
    Settings,
};

/// Exit code for an interrupt, by shell convention 128 + SIGINT.
const EXIT_INTERRUPTED: u8 = 130;
const EXIT_REPO_FAILURES: u8 = 1;
const EXIT_LOCK_HELD: u8 = 2;
const EXIT_CONFIG: u8 = 3;

/// Codeloom - hierarchical code indexing for retrieval-augmented generation
#[derive(Parser)]
#[command(
    name = "codeloom",
    version,
    about = "Index Git repositories into a searchable vector hierarchy",
    long_about = "Codeloom ingests Git repositories into a four-level document hierarchy\n\
                  (symbol, file, module, repository) with LLM summaries and embeddings,\n\
                  ready for hybrid text + vector search."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion pipeline
    #[command(group(
        ArgGroup::new("target").args(["all", "repo", "status"]).required(true)
    ))]
    Ingest {
        /// Process every desired repository
        #[arg(long)]
        all: bool,

        /// Process a single repository (OWNER/NAME)
        #[arg(long, value_name = "OWNER/NAME")]
        repo: Option<String>,

        /// Reconcile, detect, parse and summarize without writing to the store
        #[arg(long)]
        dry_run: bool,

        /// Skip repositories whose repo summary already matches HEAD
        #[arg(long)]
        skip_existing: bool,

        /// Print whether a pipeline run is in progress and exit
        #[arg(long)]
        status: bool,
    },

    /// Re-normalize stored embeddings in place
    NormalizeEmbeddings {
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Recompute PageRank criticality scores for all module summaries
    BackfillCriticality,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let result = match cli.command {
        Commands::Ingest { status: true, .. } => {
            return match holder(&settings.lock_path()) {
                Some(info) => {
                    println!("running: pid {}, started {}", info.pid, info.started_at);
                    ExitCode::SUCCESS
                }
                None => {
                    println!("idle");
                    ExitCode::SUCCESS
                }
            };
        }
        Commands::Ingest { all, repo, dry_run, skip_existing, .. } => {
            let target = match repo {
                Some(repo_id) => IngestTarget::Repo(repo_id),
                None if all => IngestTarget::All,
                None => unreachable!("clap group guarantees a target"),
            };
            run_ingest(&settings, PipelineOptions { target, dry_run, skip_existing }).await
        }
        Commands::NormalizeEmbeddings { dry_run } => run_normalize(&settings, dry_run).await,
        Commands::BackfillCriticality => run_backfill(&settings).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            match e {
                IngestError::AlreadyRunning { .. } => ExitCode::from(EXIT_LOCK_HELD),
                IngestError::Config(_) => ExitCode::from(EXIT_CONFIG),
                _ => ExitCode::from(EXIT_REPO_FAILURES),
            }
        }
    }
}

fn open_store(settings: &Settings) -> Result<Arc<HttpDocumentStore>, IngestError> {
    Ok(Arc::new(HttpDocumentStore::new(
        settings.doc_store_host.clone(),
        settings.doc_store_bucket.clone(),
        settings.doc_store_user.clone(),
        settings.doc_store_password.clone(),
        settings.embedding_dim,
    )?))
}

async fn run_ingest(
    settings: &Settings,
    options: PipelineOptions,
) -> Result<ExitCode, IngestError> {
    let store = open_store(settings)?;
    let enricher = Arc::new(Enricher::new(Box::new(HttpLlm::new(
        settings.llm_provider,
        settings.llm_endpoint.clone(),
        settings.llm_model.clone(),
    )?)));
    let embedder = Arc::new(HttpEmbedder::new(
        settings.embedding_endpoint.clone(),
        settings.embedding_mode,
        settings.embedding_dim,
        settings.embedding_batch,
    )?);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received; draining in-flight work");
            signal_cancel.cancel();
        }
    });

    let pipeline = Pipeline::new(settings.clone(), store, enricher, embedder, cancel)?;
    let outcome = pipeline.run(&options).await?;
    print_conclusion(&outcome);

    Ok(match outcome.status {
        RunStatus::Interrupted => ExitCode::from(EXIT_INTERRUPTED),
        RunStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::from(EXIT_REPO_FAILURES),
    })
}

fn print_conclusion(outcome: &RunOutcome) {
    let c = &outcome.counters;
    let status = match outcome.status {
        RunStatus::Completed => outcome.status.name().green().bold(),
        RunStatus::Interrupted | RunStatus::CompletedWithErrors => {
            outcome.status.name().yellow().bold()
        }
        _ => outcome.status.name().red().bold(),
    };
    println!(
        "{status}: {} repos processed ({} skipped, {} updated, {} full re-ingest, \
         {} cloned, {} deleted, {} errors), {} files processed, {} deleted, \
         {} llm tokens",
        c.repos_processed,
        c.repos_skipped,
        c.repos_updated,
        c.repos_full_reingest,
        c.repos_cloned,
        c.repos_deleted,
        c.repos_error,
        c.files_processed,
        c.files_deleted,
        outcome.llm_tokens,
    );
}

async fn run_normalize(settings: &Settings, dry_run: bool) -> Result<ExitCode, IngestError> {
    let store = open_store(settings)?;
    store.ping().await?;
    let (fixed, skipped) = normalize_embeddings(store.as_ref(), dry_run).await?;
    let verb = if dry_run { "would re-normalize" } else { "re-normalized" };
    println!("{verb} {fixed} embeddings, {skipped} already in tolerance");
    Ok(ExitCode::SUCCESS)
}

async fn run_backfill(settings: &Settings) -> Result<ExitCode, IngestError> {
    let store = open_store(settings)?;
    store.ping().await?;
    let stats = codeloom_engine::criticality::backfill_all(store.as_ref()).await?;
    println!(
        "scored {} modules over {} import edges",
        stats.modules_scored, stats.edges
    );
    Ok(ExitCode::SUCCESS)
}
