use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use localkb_core::config::Config;
use localkb_core::types::Meta;
use localkb_engine::ingest::{expand_paths, is_document_error};
use localkb_engine::{execute_tool, tool_definitions, KnowledgeBase};

#[derive(Parser)]
#[command(name = "localkb", version, about = "Ingest documents into a local knowledge base and query them")]
struct Cli {
    /// Directory holding config.toml
    #[arg(long, global = true, env = "LOCALKB_CONFIG_DIR", default_value = ".")]
    config: PathBuf,

    /// Collection to operate on (defaults to storage.default_collection)
    #[arg(short, long, global = true)]
    collection: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Ingest files or directories (txt, md, pdf)")]
    Ingest {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },

    #[command(about = "Add one document from inline text or a file")]
    Add {
        #[arg(long)]
        source_id: String,
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        text: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        /// Metadata as key=value, repeatable
        #[arg(long = "meta", value_parser = parse_key_val)]
        metadata: Vec<(String, String)>,
    },

    #[command(about = "Ingest a video transcript, one segment per line")]
    Transcript {
        /// YouTube URL or video id
        video: String,
        #[arg(long)]
        file: PathBuf,
    },

    #[command(about = "Search the knowledge base")]
    Query {
        text: String,
        #[arg(short)]
        k: Option<usize>,
        /// Plain similarity ranking instead of MMR
        #[arg(long)]
        no_mmr: bool,
        #[arg(long)]
        fetch_k: Option<usize>,
        /// MMR trade-off between relevance (1.0) and diversity (0.0)
        #[arg(long)]
        lambda: Option<f32>,
    },

    #[command(about = "Show collection statistics")]
    Stats,

    #[command(about = "Remove every chunk from the collection")]
    Clear,

    #[command(about = "Delete the collection and its storage")]
    Drop,

    #[command(about = "List collections")]
    Collections,

    #[command(about = "Print the tool definitions as JSON")]
    Tools,

    #[command(about = "Run a tool call, e.g. call query_knowledge_base '{\"query\": \"...\"}'")]
    Call {
        tool: String,
        #[arg(default_value = "{}")]
        args: String,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String)> {
    let (k, v) = s.split_once('=').ok_or_else(|| anyhow!("expected key=value, got '{s}'"))?;
    Ok((k.trim().to_string(), v.to_string()))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn ingest(kb: &KnowledgeBase, collection: &str, paths: &[PathBuf]) -> Result<Value> {
    let files = expand_paths(paths);
    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} documents {msg}")?
            .progress_chars("#>-"),
    );
    let results = kb
        .ingest_files(collection, files, |path, _| {
            pb.set_message(path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default());
            pb.inc(1);
        })
        .await;
    pb.finish_and_clear();

    let mut failed = 0usize;
    let mut fatal = None;
    let rows: Vec<Value> = results
        .into_iter()
        .map(|(path, result)| match result {
            Ok(r) => json!({
                "path": path,
                "success": true,
                "chunks_added": r.chunks_added,
                "replaced": r.replaced,
                "unchanged": r.unchanged,
            }),
            Err(e) => {
                failed += 1;
                if !is_document_error(&e) && fatal.is_none() {
                    fatal = Some(e.to_string());
                }
                json!({ "path": path, "success": false, "error": e.to_string() })
            }
        })
        .collect();
    let summary = json!({ "collection": collection, "documents": rows.len(), "failed": failed, "results": rows });
    if let Some(err) = fatal {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Err(anyhow!("ingestion stopped by a storage or embedding failure: {err}"));
    }
    Ok(summary)
}

async fn run(kb: &KnowledgeBase, collection: &str, command: Command) -> Result<Value> {
    let out = match command {
        Command::Ingest { paths } => ingest(kb, collection, &paths).await?,
        Command::Add { source_id, text, file, metadata } => {
            let content = match (text, file) {
                (Some(t), _) => t,
                (None, Some(f)) => std::fs::read_to_string(&f).with_context(|| format!("reading {}", f.display()))?,
                (None, None) => return Err(anyhow!("either --text or --file is required")),
            };
            let metadata: Meta = metadata.into_iter().collect();
            serde_json::to_value(kb.add_text(collection, source_id, content, metadata).await?)?
        }
        Command::Transcript { video, file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let segments: Vec<&str> = raw.lines().collect();
            serde_json::to_value(kb.ingest_transcript(collection, &video, &segments).await?)?
        }
        Command::Query { text, k, no_mmr, fetch_k, lambda } => {
            let mut opts = kb.query_options();
            opts.k = k.unwrap_or(opts.k);
            opts.fetch_k = fetch_k.unwrap_or(opts.fetch_k.max(opts.k));
            opts.lambda_mult = lambda.unwrap_or(opts.lambda_mult);
            opts.use_mmr = opts.use_mmr && !no_mmr;
            let hits = kb.query(collection, &text, &opts).await?;
            json!({ "collection": collection, "query": text, "mmr": opts.use_mmr, "results": hits })
        }
        Command::Stats => serde_json::to_value(kb.stats(collection).await?)?,
        Command::Clear => json!({ "collection": collection, "cleared": true, "removed_chunks": kb.clear(collection).await? }),
        Command::Drop => json!({ "collection": collection, "dropped": kb.drop_collection(collection).await? }),
        Command::Collections => json!(kb.list_collections().await?),
        Command::Tools => json!(tool_definitions()),
        Command::Call { tool, args } => execute_tool(kb, &tool, &args).await,
    };
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Config::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?
        .settings()?;
    tracing::debug!(root = %settings.storage.root.display(), backend = ?settings.embedding.backend, "configuration loaded");
    let kb = KnowledgeBase::open(settings).await?;
    let collection = cli.collection.unwrap_or_else(|| kb.default_collection().to_string());

    let result = run(&kb, &collection, cli.command).await;
    kb.close().await;
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
