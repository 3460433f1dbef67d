//! # Reqsolve CLI (`reqsolve`)
//!
//! The `reqsolve` binary drives the requirement-resolution pipeline:
//! database initialization, provider management, document ingestion, batch
//! analysis, and result retrieval.
//!
//! ## Usage
//!
//! ```bash
//! reqsolve --config ./config/reqsolve.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `reqsolve init` | Create the SQLite database and run schema migrations |
//! | `reqsolve provider add` | Register an external provider |
//! | `reqsolve provider list` | List registered providers |
//! | `reqsolve provider set-default` | Change a kind's default provider |
//! | `reqsolve ingest` | Embed and index a document's sections |
//! | `reqsolve analyze` | Resolve a batch of requirements |
//! | `reqsolve status <task-id>` | Show a task's progress |
//! | `reqsolve results <task-id>` | Print a task's answers and match stats |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! reqsolve init
//!
//! # Register an embedding provider (key read from the named env var)
//! reqsolve provider add --kind embedding --name openai \
//!     --endpoint https://api.openai.com/v1/embeddings \
//!     --model text-embedding-3-small --dims 1536 \
//!     --credentials-ref OPENAI_API_KEY --default
//!
//! # Ingest a document, one paragraph per line
//! reqsolve ingest --document spec-v2 ./docs/spec-v2.txt
//!
//! # Resolve a requirements file, scoped to two documents
//! reqsolve analyze --user alice --documents spec-v2,faq ./reqs.txt
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use reqsolve::cache::{spawn_invalidator, SearchCache};
use reqsolve::config::{self, Config};
use reqsolve::ingest::{self, Section};
use reqsolve::models::{ContentKind, MatchType, ProviderKind, Scope};
use reqsolve::providers::CapabilitySource;
use reqsolve::registry::{NewProvider, ProviderRegistry};
use reqsolve::resolve::Resolver;
use reqsolve::store::VectorStore;
use reqsolve::task::{CancelToken, TaskTracker};
use reqsolve::{db, migrate};

/// Reqsolve — a tiered requirement-resolution pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/reqsolve.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "reqsolve",
    about = "Reqsolve — tiered resolution of requirement batches against an indexed corpus",
    version,
    long_about = "Reqsolve answers batches of free-text requirements by trying progressively \
    more expensive strategies — exact match, vector similarity, web search, LLM generation — \
    and stopping at the first one that is good enough."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/reqsolve.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent;
    /// running it multiple times is safe.
    Init,

    /// Manage external providers.
    Provider {
        #[command(subcommand)]
        action: ProviderAction,
    },

    /// Embed and index a document.
    ///
    /// The input file is plain text; each non-empty line becomes one
    /// paragraph-level section.
    Ingest {
        /// Logical document id the sections are stored under.
        #[arg(long)]
        document: String,

        /// Path to the document text file.
        file: PathBuf,
    },

    /// Resolve a batch of requirements from a file.
    ///
    /// The input file holds one requirement per line. The command runs the
    /// task to completion and prints the task id; use `status` and
    /// `results` afterwards.
    Analyze {
        /// User the task is attributed to.
        #[arg(long)]
        user: String,

        /// Restrict document matching to these document ids
        /// (comma-separated). Unscoped by default.
        #[arg(long, value_delimiter = ',')]
        documents: Vec<String>,

        /// Path to the requirements file.
        file: PathBuf,
    },

    /// Show a task's status and progress.
    Status {
        /// Task id returned by `analyze`.
        task_id: String,
    },

    /// Print a task's per-requirement answers and match statistics.
    Results {
        /// Task id returned by `analyze`.
        task_id: String,
    },
}

#[derive(Subcommand)]
enum ProviderAction {
    /// Register a provider config.
    Add {
        /// Provider kind: `llm`, `embedding`, or `web_search`.
        #[arg(long)]
        kind: String,

        /// Unique name within the kind.
        #[arg(long)]
        name: String,

        /// HTTP endpoint for the provider API.
        #[arg(long)]
        endpoint: String,

        /// Environment variable holding the API key. The key itself is
        /// never stored.
        #[arg(long)]
        credentials_ref: Option<String>,

        /// Model identifier (required for llm and embedding kinds).
        #[arg(long)]
        model: Option<String>,

        /// Embedding dimensionality (embedding kind only).
        #[arg(long)]
        dims: Option<usize>,

        /// Extra request parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,

        /// Make this the kind's default provider.
        #[arg(long)]
        default: bool,
    },

    /// List registered providers.
    List {
        /// Restrict to one kind.
        #[arg(long)]
        kind: Option<String>,

        /// Include deactivated providers.
        #[arg(long)]
        all: bool,
    },

    /// Promote a provider to its kind's default.
    SetDefault {
        #[arg(long)]
        kind: String,
        #[arg(long)]
        name: String,
    },

    /// Deactivate a provider.
    Deactivate {
        #[arg(long)]
        kind: String,
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Provider { action } => {
            provider_command(&cfg, action).await?;
        }
        Commands::Ingest { document, file } => {
            ingest_command(&cfg, &document, &file).await?;
        }
        Commands::Analyze {
            user,
            documents,
            file,
        } => {
            analyze_command(&cfg, &user, documents, &file).await?;
        }
        Commands::Status { task_id } => {
            status_command(&cfg, &task_id).await?;
        }
        Commands::Results { task_id } => {
            results_command(&cfg, &task_id).await?;
        }
    }

    Ok(())
}

async fn provider_command(cfg: &Config, action: ProviderAction) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let timeout = Duration::from_secs(cfg.policy.provider_timeout_secs);
    let registry = ProviderRegistry::new(pool, timeout);

    match action {
        ProviderAction::Add {
            kind,
            name,
            endpoint,
            credentials_ref,
            model,
            dims,
            params,
            default,
        } => {
            let kind = ProviderKind::parse(&kind)?;
            let params: serde_json::Value =
                serde_json::from_str(&params).context("Failed to parse --params as JSON")?;
            let created = registry
                .create(&NewProvider {
                    name,
                    kind,
                    endpoint,
                    credentials_ref,
                    model,
                    params,
                    dims,
                    make_default: default,
                })
                .await?;
            println!(
                "Registered {}/{}{}",
                created.kind.as_str(),
                created.name,
                if created.is_default { " (default)" } else { "" }
            );
        }
        ProviderAction::List { kind, all } => {
            let kind = kind.as_deref().map(ProviderKind::parse).transpose()?;
            let configs = registry.list(kind, !all).await?;
            if configs.is_empty() {
                println!("No providers registered.");
            }
            for config in configs {
                println!(
                    "{:<11} {:<20} {}{}{}",
                    config.kind.as_str(),
                    config.name,
                    config.endpoint,
                    if config.is_default { "  [default]" } else { "" },
                    if config.is_active { "" } else { "  [inactive]" },
                );
            }
        }
        ProviderAction::SetDefault { kind, name } => {
            let kind = ProviderKind::parse(&kind)?;
            registry.set_default(kind, &name).await?;
            println!("Default {} provider is now {name}.", kind.as_str());
        }
        ProviderAction::Deactivate { kind, name } => {
            let kind = ProviderKind::parse(&kind)?;
            registry.deactivate(kind, &name).await?;
            println!("Deactivated {}/{name}.", kind.as_str());
        }
    }

    Ok(())
}

async fn ingest_command(cfg: &Config, document: &str, file: &PathBuf) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read document file: {}", file.display()))?;

    let pool = db::connect(cfg).await?;
    let store = VectorStore::new(pool.clone());
    let timeout = Duration::from_secs(cfg.policy.provider_timeout_secs);
    let registry = ProviderRegistry::new(pool, timeout);
    let embedder = registry.embedder().await?;

    let sections: Vec<Section> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Section {
            chapter_id: None,
            kind: ContentKind::Paragraph,
            text: line.to_string(),
        })
        .collect();

    let stats = ingest::ingest_sections(&store, &embedder, document, &sections).await?;
    println!(
        "Ingested {document}: {} new, {} unchanged, {} skipped.",
        stats.inserted, stats.unchanged, stats.skipped
    );
    Ok(())
}

async fn analyze_command(
    cfg: &Config,
    user: &str,
    documents: Vec<String>,
    file: &PathBuf,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read requirements file: {}", file.display()))?;
    let requirements = ingest::parse_requirements(&text);
    if requirements.is_empty() {
        anyhow::bail!("No requirements found in {}", file.display());
    }

    let pool = db::connect(cfg).await?;
    let store = VectorStore::new(pool.clone());
    let cache = SearchCache::new(pool.clone());
    let invalidator = spawn_invalidator(cache.clone(), store.touched());

    let timeout = Duration::from_secs(cfg.policy.provider_timeout_secs);
    let registry: Arc<ProviderRegistry> = Arc::new(ProviderRegistry::new(pool.clone(), timeout));
    registry.reload().await?;

    let resolver = Arc::new(Resolver::new(
        store,
        cache,
        registry,
        cfg.policy.clone(),
    ));
    let tracker = TaskTracker::new(pool, resolver, cfg.policy.clone());

    let scope = if documents.is_empty() {
        None
    } else {
        Some(Scope::new(documents))
    };
    let filename = file.file_name().and_then(|n| n.to_str());

    let task_id = tracker.create_task(user, filename, &requirements).await?;
    println!("Task {task_id}: {} requirements.", requirements.len());

    tracker.run(&task_id, scope.as_ref(), &CancelToken::new()).await?;
    invalidator.abort();

    let task = tracker.get_task(&task_id).await?;
    println!(
        "Task {task_id} {} ({}/{} processed).",
        task.status.as_str(),
        task.processed_count,
        task.total_requirements
    );
    Ok(())
}

async fn status_command(cfg: &Config, task_id: &str) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let tracker = bare_tracker(cfg, pool).await?;
    let task = tracker.get_task(task_id).await?;

    println!("Task:      {}", task.id);
    println!("User:      {}", task.user_id);
    println!("Status:    {}", task.status.as_str());
    println!(
        "Progress:  {}/{}",
        task.processed_count, task.total_requirements
    );
    if let Some(error) = &task.error_message {
        println!("Error:     {error}");
    }
    Ok(())
}

async fn results_command(cfg: &Config, task_id: &str) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let tracker = bare_tracker(cfg, pool).await?;

    let results = tracker.get_results(task_id).await?;
    if results.is_empty() {
        println!("No results for task {task_id}.");
        return Ok(());
    }

    let mut stats: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
    for result in &results {
        *stats.entry(result.match_type.as_str()).or_default() += 1;

        println!(
            "[{}] {} (confidence {:.2}, {})",
            result.requirement_index,
            result.requirement_title,
            result.confidence,
            result.match_type.as_str(),
        );
        if result.match_type == MatchType::None {
            println!("    <unresolved>");
        } else {
            println!("    {}", result.answer);
        }
    }

    println!();
    let summary: Vec<String> = stats
        .iter()
        .map(|(match_type, count)| format!("{match_type}: {count}"))
        .collect();
    println!("Matches: {}", summary.join(", "));
    Ok(())
}

/// Tracker wired with a live registry; used by read-only commands that
/// never invoke providers.
async fn bare_tracker(cfg: &Config, pool: sqlx::SqlitePool) -> anyhow::Result<TaskTracker> {
    let store = VectorStore::new(pool.clone());
    let cache = SearchCache::new(pool.clone());
    let timeout = Duration::from_secs(cfg.policy.provider_timeout_secs);
    let registry: Arc<ProviderRegistry> = Arc::new(ProviderRegistry::new(pool.clone(), timeout));
    let resolver = Arc::new(Resolver::new(store, cache, registry, cfg.policy.clone()));
    Ok(TaskTracker::new(pool, resolver, cfg.policy.clone()))
}
