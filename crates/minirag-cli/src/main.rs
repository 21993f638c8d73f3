//! minirag CLI - Command-line interface
//!
//! Usage:
//!   minirag add-asset <project> <file>
//!   minirag index <project> [--file <name>] [--reset]
//!   minirag search <project> <query> [--limit N]
//!   minirag answer <project> <query> [--limit N]
//!   minirag stories <path>
//!   minirag info <project>
//!   minirag reset <project>
//!   minirag collections

mod chunker;

use anyhow::Context;
use chunker::TextFileChunkSource;
use clap::{Parser, Subcommand};
use minirag_core::{AppConfig, LoggingConfig, MetadataStore, VectorBackend};
use minirag_rag::{
    create_llm_client, AnswerService, IndexRequest, IndexingPipeline, IndexingProgress,
    PipelineConfig, RetrievalService, SearchOutcome, TemplateRegistry, DEFAULT_SEARCH_LIMIT,
};
use minirag_vector::{create_embedding_provider, create_vector_store, VectorStore};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "minirag")]
#[command(about = "Document indexing and retrieval-augmented answers")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables take precedence)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an uploaded file with a project
    AddAsset {
        project: i64,
        /// File name under the project's files directory
        file: String,
    },
    /// Index a project's chunks into its vector collection
    Index {
        project: i64,
        /// Only ingest this file
        #[arg(long)]
        file: Option<String>,
        /// Drop the collection and stored chunks first
        #[arg(long)]
        reset: bool,
    },
    /// Rank a project's chunks against a query
    Search {
        project: i64,
        query: String,
        #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,
    },
    /// Answer a question from a project's documents
    Answer {
        project: i64,
        query: String,
        #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,
    },
    /// Generate task stories from a document
    Stories {
        /// Document to read
        path: PathBuf,
    },
    /// Show a project's collection
    Info { project: i64 },
    /// Drop a project's collection
    Reset { project: i64 },
    /// List all collections
    Collections,
}

fn init_tracing(logging: &LoggingConfig) {
    let default_directive = format!(
        "minirag={0},minirag_rag={0},minirag_vector={0},minirag_core={0}",
        logging.level
    );
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directive.into());

    if logging.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

async fn open_metadata(config: &AppConfig) -> anyhow::Result<MetadataStore> {
    let store = MetadataStore::new(&config.database.postgres_url, config.database.pool_size)
        .await
        .context("connecting to the chunk database")?;
    store.migrate().await?;
    Ok(store)
}

/// Open the configured vector store, sharing `metadata`'s pool for pgvector
async fn open_vector_store(
    config: &AppConfig,
    metadata: Option<&MetadataStore>,
) -> anyhow::Result<Arc<dyn VectorStore>> {
    let pool = match (config.vector.backend, metadata) {
        (VectorBackend::PgVector, Some(store)) => Some(store.pool().clone()),
        (VectorBackend::PgVector, None) => Some(open_metadata(config).await?.pool().clone()),
        _ => None,
    };
    Ok(create_vector_store(&config.vector, pool).await?)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::AddAsset { project, file } => {
            let metadata = open_metadata(&config).await?;
            let source = TextFileChunkSource::from_config(&config.indexing);
            let path = source.asset_path(project, &file);
            if !path.is_file() {
                anyhow::bail!("{} does not exist", path.display());
            }

            let asset = metadata.create_asset(project, &file).await?;
            print_json(&asset)?;
        }
        Commands::Index {
            project,
            file,
            reset,
        } => {
            let metadata = Arc::new(open_metadata(&config).await?);
            let vector_store = open_vector_store(&config, Some(metadata.as_ref())).await?;
            let embedder = create_embedding_provider(&config.llm)?;

            let pipeline = IndexingPipeline::new(
                vector_store.clone(),
                embedder,
                metadata.clone(),
                metadata.clone(),
                Arc::new(TextFileChunkSource::from_config(&config.indexing)),
            )
            .with_config(PipelineConfig::from_config(&config.indexing, &config.vector))
            .with_progress(Arc::new(|progress: IndexingProgress| {
                tracing::info!(
                    pages = progress.pages,
                    inserted = progress.inserted_items,
                    files = progress.files_processed,
                    "Progress"
                );
            }));

            let mut request = IndexRequest::project(project).with_reset(reset);
            if let Some(file) = file {
                request = request.with_file(file);
            }

            let result = pipeline.run(request).await;
            vector_store.disconnect().await?;
            print_json(&result?)?;
        }
        Commands::Search {
            project,
            query,
            limit,
        } => {
            let vector_store = open_vector_store(&config, None).await?;
            let retrieval =
                RetrievalService::new(vector_store, create_embedding_provider(&config.llm)?);

            match retrieval.search(project, &query, limit).await? {
                SearchOutcome::Matches(results) => print_json(&results)?,
                SearchOutcome::NoEmbedding => anyhow::bail!("query could not be embedded"),
                SearchOutcome::NoMatches => println!("No matches."),
            }
        }
        Commands::Answer {
            project,
            query,
            limit,
        } => {
            let vector_store = open_vector_store(&config, None).await?;
            let retrieval =
                RetrievalService::new(vector_store, create_embedding_provider(&config.llm)?);
            let service = AnswerService::new(
                retrieval,
                create_llm_client(&config.llm)?,
                TemplateRegistry::new(
                    &config.templates.language,
                    &config.templates.default_language,
                ),
            )
            .with_max_input_characters(config.llm.max_input_characters);

            match service.answer(project, &query, limit).await? {
                Some(answer) => print_json(&answer)?,
                None => println!("No relevant documents found."),
            }
        }
        Commands::Stories { path } => {
            let document = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let vector_store = open_vector_store(&config, None).await?;
            let retrieval =
                RetrievalService::new(vector_store, create_embedding_provider(&config.llm)?);
            let service = AnswerService::new(
                retrieval,
                create_llm_client(&config.llm)?,
                TemplateRegistry::new(
                    &config.templates.language,
                    &config.templates.default_language,
                ),
            )
            .with_max_input_characters(config.llm.max_input_characters);

            println!("{}", service.generate_stories(&document).await?);
        }
        Commands::Info { project } => {
            let vector_store = open_vector_store(&config, None).await?;
            let retrieval =
                RetrievalService::new(vector_store, create_embedding_provider(&config.llm)?);

            match retrieval.collection_info(project).await? {
                Some(info) => print_json(&info)?,
                None => println!("Collection {} not found.", retrieval.collection_for(project)),
            }
        }
        Commands::Reset { project } => {
            let vector_store = open_vector_store(&config, None).await?;
            let retrieval =
                RetrievalService::new(vector_store, create_embedding_provider(&config.llm)?);

            let deleted = retrieval.reset_collection(project).await?;
            print_json(&serde_json::json!({
                "collection": retrieval.collection_for(project),
                "deleted": deleted,
            }))?;
        }
        Commands::Collections => {
            let vector_store = open_vector_store(&config, None).await?;
            for name in vector_store.list_collections().await? {
                println!("{name}");
            }
        }
    }

    Ok(())
}
