use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use paperkg_core::{
    ExtractionOptions, ExtractionQuality, KnowledgeGraph, KnowledgeGraphBuilder, MemoryGraph,
    Neo4jGraph, OcrEndpointConfig, OpenAiCompatibleModel, PdfFetcher, ReasoningAgent, ToolBox,
    DEFAULT_MAX_STEPS,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "paperkg", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    neo4j: Neo4jArgs,

    #[command(flatten)]
    llm: LlmArgs,

    /// HTTP timeout in seconds for the model, OCR and graph endpoints
    #[arg(long, default_value = "120")]
    timeout_secs: u64,
}

#[derive(Args)]
struct Neo4jArgs {
    /// Neo4j HTTP base URL
    #[arg(long, env = "NEO4J_URI", default_value = "http://localhost:7474")]
    neo4j_url: String,

    /// Neo4j database name
    #[arg(long, env = "NEO4J_DATABASE", default_value = "neo4j")]
    neo4j_db: String,

    /// Neo4j username
    #[arg(long, env = "NEO4J_USER", default_value = "neo4j")]
    neo4j_user: String,

    /// Neo4j password
    #[arg(long, env = "NEO4J_PASSWORD", default_value = "password", hide_env_values = true)]
    neo4j_password: String,
}

#[derive(Args)]
struct LlmArgs {
    /// Base URL of an OpenAI-compatible API
    #[arg(long, env = "LLM_API_BASE", default_value = "http://localhost:11434/v1")]
    llm_api_base: String,

    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    /// Chat model used for extraction and answering
    #[arg(long, env = "LLM_MODEL", default_value = "gpt-4o-mini")]
    llm_model: String,

    #[arg(long, default_value = "0.0")]
    temperature: f32,

    /// Multimodal OCR endpoint used by high quality extraction
    #[arg(long, env = "LLM_OCR_ENDPOINT")]
    ocr_endpoint: Option<String>,

    #[arg(long, env = "LLM_OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a PDF and build its knowledge graph.
    Build {
        /// URL or file path of the PDF.
        #[arg(long)]
        locator: String,
        /// Document id to store the graph under. A new one is generated when omitted.
        #[arg(long, alias = "session-id")]
        document_id: Option<String>,
        /// Extraction quality: fast or high.
        #[arg(long, default_value = "fast")]
        quality: ExtractionQuality,
        /// Build into an in-memory graph and print its statistics instead of writing to Neo4j.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Answer a question about a document using the graph tools.
    Ask {
        #[arg(long, alias = "session-id")]
        document_id: String,
        #[arg(long)]
        question: String,
        #[arg(long, default_value_t = DEFAULT_MAX_STEPS)]
        max_steps: usize,
    },
    /// Run one retrieval tool and print its output.
    Tool {
        #[arg(long, alias = "session-id")]
        document_id: String,
        /// Tool name, e.g. search_kg or multi_hop_search.
        #[arg(long)]
        name: String,
        /// JSON arguments. Plain text is passed as the single argument.
        #[arg(long, default_value = "{}")]
        arguments: String,
    },
    /// Print entity and relationship counts with sample edges.
    Stats {
        #[arg(long, alias = "session-id")]
        document_id: String,
        #[arg(long, default_value = "30")]
        sample: usize,
        /// Print only the sample edges and skip the counts.
        #[arg(long, default_value_t = false)]
        samples_only: bool,
    },
    /// Delete every relationship of a document.
    Clear {
        #[arg(long, alias = "session-id")]
        document_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    let dotenv = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    if let Err(error) = dotenv {
        if !error.not_found() {
            warn!(%error, "unable to load .env file");
        }
    }

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout_secs);
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("building http client")?;

    let graph = Neo4jGraph::new(
        &cli.neo4j.neo4j_url,
        &cli.neo4j.neo4j_db,
        &cli.neo4j.neo4j_user,
        &cli.neo4j.neo4j_password,
        client.clone(),
    )?;
    let model = OpenAiCompatibleModel::new(
        &cli.llm.llm_api_base,
        &cli.llm.llm_model,
        cli.llm.temperature,
        timeout,
        cli.llm.llm_api_key.clone(),
    )?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "paperkg boot"
    );

    match cli.command {
        Command::Build {
            locator,
            document_id,
            quality,
            dry_run,
        } => {
            let ocr = cli
                .llm
                .ocr_endpoint
                .and_then(|endpoint| OcrEndpointConfig::new(endpoint, cli.llm.ocr_api_key));
            let fetcher = PdfFetcher::new(client, ocr);

            if dry_run {
                let memory = Arc::new(MemoryGraph::new());
                let builder = KnowledgeGraphBuilder::new(
                    fetcher,
                    model,
                    Arc::clone(&memory),
                    ExtractionOptions::default(),
                );
                let report = builder
                    .build(&locator, document_id.as_deref(), quality)
                    .await?;
                print_json(&report)?;
                print_json(&memory.statistics(report.document_id(), 30).await?)?;
            } else {
                let builder =
                    KnowledgeGraphBuilder::new(fetcher, model, graph, ExtractionOptions::default());
                let report = builder
                    .build(&locator, document_id.as_deref(), quality)
                    .await?;
                print_json(&report)?;
            }
        }
        Command::Ask {
            document_id,
            question,
            max_steps,
        } => {
            let agent = ReasoningAgent::new(model, ToolBox::new(graph, document_id))
                .with_max_steps(max_steps);
            let answer = agent.answer(&question).await?;
            print_json(&answer)?;
        }
        Command::Tool {
            document_id,
            name,
            arguments,
        } => {
            let arguments = serde_json::from_str::<Value>(&arguments)
                .unwrap_or_else(|_| Value::String(arguments));
            let toolbox = ToolBox::new(graph, document_id);
            println!("{}", toolbox.invoke(&name, &arguments).await);
        }
        Command::Stats {
            document_id,
            sample,
            samples_only,
        } => {
            if samples_only {
                print_json(&graph.sample(&document_id, sample).await?)?;
            } else {
                print_json(&graph.statistics(&document_id, sample).await?)?;
            }
        }
        Command::Clear { document_id } => {
            graph.clear_graph(&document_id).await?;
            println!(
                "cleared relationships of document_id={document_id} at {}",
                Utc::now().to_rfc3339()
            );
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
