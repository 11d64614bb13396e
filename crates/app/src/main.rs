mod server;

use anyhow::Context;
use case_qa_core::{
    build_or_rebuild, AgentConfig, CharacterNgramEmbedder, ChatSession, Embedder,
    HttpModelClient, IngestionOptions, ReasoningAgent, RemoteEmbedder, SessionStore,
    UploadCache, VectorIndex,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "case-qa",
    version,
    about = "Retrieval-grounded legal case Q&A with page-level citations"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build or rebuild the persisted passage index from a folder of
    /// case-sheet PDFs.
    BuildIndex {
        /// Folder containing case-sheet PDFs (searched recursively).
        #[arg(long, env = "CASE_SHEETS_DIR", default_value = "./case_sheets")]
        corpus_dir: PathBuf,
        /// Directory the index artifact is written to.
        #[arg(long, env = "INDEX_DIR", default_value = "./index")]
        index_dir: PathBuf,
    },
    /// Serve the chat API over HTTP.
    Serve {
        #[arg(long, env = "INDEX_DIR", default_value = "./index")]
        index_dir: PathBuf,
        /// Bind address.
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "PORT", default_value_t = 5000)]
        port: u16,
    },
    /// Answer a single question from the command line.
    Ask {
        #[arg(long, env = "INDEX_DIR", default_value = "./index")]
        index_dir: PathBuf,
        /// The question to answer.
        #[arg(long)]
        query: String,
        /// Number of passages to retrieve per search.
        #[arg(long, default_value_t = 6)]
        top_k: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::BuildIndex {
            corpus_dir,
            index_dir,
        } => build_index(&corpus_dir, &index_dir),
        Command::Serve {
            index_dir,
            host,
            port,
        } => serve(&index_dir, &host, port).await,
        Command::Ask {
            index_dir,
            query,
            top_k,
        } => ask(&index_dir, &query, top_k).await,
    }
}

/// Remote embedding service when configured, the local deterministic
/// embedder otherwise. Whichever is chosen is pinned into the index manifest
/// at build time and re-checked at load time.
fn build_embedder() -> anyhow::Result<Arc<dyn Embedder>> {
    match RemoteEmbedder::from_env()? {
        Some(remote) => {
            info!(model = remote.model_id(), "using remote embedding service");
            Ok(Arc::new(remote))
        }
        None => {
            let local = CharacterNgramEmbedder::default();
            info!(model = local.model_id(), "using local deterministic embedder");
            Ok(Arc::new(local))
        }
    }
}

fn build_index(corpus_dir: &Path, index_dir: &Path) -> anyhow::Result<()> {
    let embedder = build_embedder()?;
    let report = build_or_rebuild(
        corpus_dir,
        index_dir,
        embedder.as_ref(),
        &IngestionOptions::default(),
    )?;

    if !report.skipped.is_empty() {
        println!("{} document(s) skipped as unreadable:", report.skipped.len());
        for skipped in &report.skipped {
            println!("  {}: {}", skipped.path.display(), skipped.reason);
        }
    }

    println!(
        "{} passages from {} document(s) indexed at {}",
        report.index.passage_count(),
        report.document_count,
        index_dir.display()
    );
    Ok(())
}

async fn serve(index_dir: &Path, host: &str, port: u16) -> anyhow::Result<()> {
    let embedder = build_embedder()?;
    let model =
        HttpModelClient::from_env().context("language model credentials are required to serve")?;
    let index = VectorIndex::load_or_fail(index_dir, embedder.as_ref())
        .context("refusing to serve without a loadable index")?;

    info!(
        passages = index.passage_count(),
        embedding_model = %index.manifest().embedding_model,
        "index loaded"
    );

    let state = server::AppState {
        index: Arc::new(index),
        embedder,
        model: Arc::new(model),
        sessions: Arc::new(SessionStore::new()),
        uploads: Arc::new(UploadCache::default()),
        options: IngestionOptions::default(),
    };

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("binding {host}:{port}"))?;
    info!(host, port, "chat api listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ask(index_dir: &Path, query: &str, top_k: usize) -> anyhow::Result<()> {
    let embedder = build_embedder()?;
    let model = HttpModelClient::from_env()
        .context("language model credentials are required to answer questions")?;
    let index = VectorIndex::load_or_fail(index_dir, embedder.as_ref())?;

    let agent = ReasoningAgent::new(
        &model,
        &index,
        embedder.as_ref(),
        AgentConfig::with_top_k(top_k),
    );
    let mut session = ChatSession::default();
    let outcome = agent.answer(&mut session, query, None).await?;

    println!("{}", outcome.answer);
    if outcome.incomplete {
        println!("(incomplete: the reasoning step budget ran out)");
    }
    for citation in &outcome.citations {
        println!(
            "[{} p.{} score={:.3}]",
            citation.filename, citation.page, citation.score
        );
    }
    Ok(())
}
