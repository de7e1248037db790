// src/main.rs
// Vellum CLI: maintenance commands over a vault

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use vellum::archive::Archiver;
use vellum::config::VaultConfig;
use vellum::llm::{LlmProvider, OpenAiCompatProvider};
use vellum::scope::SearchScope;
use vellum::store::{SearchOptions, VaultStore};

#[derive(Parser)]
#[command(name = "vellum", about = "Local-first conversational knowledge engine")]
struct Cli {
    /// Vault root directory
    #[arg(long, default_value = ".")]
    vault: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hybrid search over the vault corpus
    Search {
        query: String,
        /// Restrict to a folder
        #[arg(long)]
        folder: Option<String>,
        /// Restrict to a single file
        #[arg(long)]
        file: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Allow the remote LLM reranker
        #[arg(long)]
        rerank: bool,
    },
    /// Run one archiver pass over old conversations and projects
    Archive,
    /// Index statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Secrets come from the user's home config only, never the CWD
    if let Some(home) = dirs::home_dir()
        && let Err(e) = dotenvy::from_path(home.join(".vellum/.env"))
    {
        tracing::debug!("No global .env loaded: {}", e);
    }

    let cli = Cli::parse();

    let log_level = match &cli.command {
        Commands::Search { .. } => Level::WARN,
        Commands::Archive => Level::INFO,
        Commands::Stats => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let config = VaultConfig::load(&cli.vault);
    let store = Arc::new(VaultStore::open(&cli.vault, config.clone()).await?);

    match cli.command {
        Commands::Search { query, folder, file, limit, rerank } => {
            let scope = match (file, folder) {
                (Some(path), _) => SearchScope::InFile { path },
                (None, Some(path)) => SearchScope::InFolder { path },
                _ => SearchScope::Vault,
            };
            let provider = make_provider(&config);
            let hits = store
                .search(
                    provider.as_deref(),
                    &query,
                    scope,
                    SearchOptions {
                        limit,
                        anchor_path: None,
                        enable_llm_rerank: rerank,
                    },
                )
                .await?;
            if hits.is_empty() {
                println!("No matches.");
            }
            for hit in hits {
                println!("{:>6.3}  {}  ({})", hit.final_score, hit.path, hit.source);
            }
        }
        Commands::Archive => {
            let archiver = Archiver::new(store);
            let stats = archiver.maybe_run().await?;
            if stats.throttled {
                println!("Archiver throttled; try again later.");
            } else {
                println!(
                    "Moved {} conversations, {} projects ({} errors).",
                    stats.conversations_moved, stats.projects_moved, stats.errors
                );
            }
        }
        Commands::Stats => {
            let (docs, embeddings, conversations, starred) = store
                .pool()
                .interact(|conn| {
                    let docs: i64 =
                        conn.query_row("SELECT COUNT(*) FROM doc_meta", [], |r| r.get(0))?;
                    let embeddings = vellum::db::count_embeddings_sync(conn);
                    let conversations: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM chat_conversation WHERE archived = 0",
                        [],
                        |r| r.get(0),
                    )?;
                    let starred: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM starred_message WHERE active = 1",
                        [],
                        |r| r.get(0),
                    )?;
                    Ok((docs, embeddings, conversations, starred))
                })
                .await?;
            println!("documents:     {docs}");
            println!("embeddings:    {embeddings}");
            println!("conversations: {conversations}");
            println!("starred:       {starred}");
        }
    }

    Ok(())
}

/// Build the default provider from config, when an API key is available.
fn make_provider(config: &VaultConfig) -> Option<Box<dyn LlmProvider>> {
    let provider_name = &config.default_model.provider;
    let api_key = config.api_key_for(provider_name)?;
    let base_url = config
        .llm_provider_configs
        .get(provider_name)
        .and_then(|p| p.base_url.clone());
    Some(Box::new(OpenAiCompatProvider::new(api_key, base_url)))
}
