//! CLI binary for validating and running Council pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use council_llm::{EchoClient, LlmClient, OpenAiClient};
use council_pipeline::{
    Collaborators, DirectoryFixtures, EngineConfig, Pipeline, PipelineEngine, PipelineEvent,
    RunOptions, Severity,
};
use council_template::{stringify, MacroDefinition};

#[derive(Parser)]
#[command(name = "council", version, about = "JSON-defined multi-agent LLM pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline from a JSON file
    Run {
        /// Path to the pipeline JSON file
        pipeline: PathBuf,

        /// User input for the run. Parsed as JSON when possible, otherwise taken as text.
        #[arg(short, long, default_value = "")]
        input: String,

        /// Answer LLM calls with an echo of the prompt instead of calling a provider
        #[arg(long)]
        dry_run: bool,

        /// Engine configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Positions, teams, characters and stores (JSON fixtures)
        #[arg(short, long)]
        directory: Option<PathBuf>,

        /// Macro definitions to register (JSON array)
        #[arg(long)]
        macros: Option<PathBuf>,

        /// Host context exposed to templates as `st.*` (JSON object)
        #[arg(long)]
        host_context: Option<PathBuf>,

        /// Resolve every gavel with the value under review instead of prompting
        #[arg(long)]
        auto_approve: bool,
    },

    /// Validate a pipeline JSON file
    Validate {
        /// Path to the pipeline JSON file
        pipeline: PathBuf,
    },

    /// Show information about a pipeline
    Info {
        /// Path to the pipeline JSON file
        pipeline: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            pipeline,
            input,
            dry_run,
            config,
            directory,
            macros,
            host_context,
            auto_approve,
        } => {
            let options = RunArgs {
                input,
                dry_run,
                config,
                directory,
                macros,
                host_context,
                auto_approve,
            };
            cmd_run(&pipeline, options).await?;
        }
        Commands::Validate { pipeline } => {
            cmd_validate(&pipeline)?;
        }
        Commands::Info { pipeline } => {
            cmd_info(&pipeline)?;
        }
    }

    Ok(())
}

struct RunArgs {
    input: String,
    dry_run: bool,
    config: Option<PathBuf>,
    directory: Option<PathBuf>,
    macros: Option<PathBuf>,
    host_context: Option<PathBuf>,
    auto_approve: bool,
}

fn load_pipeline(path: &Path) -> anyhow::Result<Pipeline> {
    let source = std::fs::read_to_string(path)?;
    Ok(Pipeline::from_json_str(&source)?)
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let source = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&source)?)
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path)?;
    let diagnostics = council_pipeline::validate(&pipeline);

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        if diag.severity == Severity::Error {
            has_error = true;
        }
        println!("{diag}");
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path)?;
    let pipeline = council_pipeline::normalize_pipeline(pipeline, council_pipeline::DEFAULT_ACTION_TIMEOUT_MS);

    println!("Pipeline: {} ({})", pipeline.name, pipeline.id);
    println!("Version: {}", pipeline.version);
    if !pipeline.description.is_empty() {
        println!("Description: {}", pipeline.description);
    }
    println!("Phases: {}", pipeline.phases.len());
    println!("Actions: {}", pipeline.action_count());

    for phase in &pipeline.phases {
        let mut flags = vec![format!("consolidation={}", phase.output.consolidation.as_str())];
        if phase.gavel.enabled {
            flags.push("gavel".into());
        }
        if phase.thread.enabled {
            flags.push("thread".into());
        }
        println!("\n{} [{}] {}", phase.id, phase.name, flags.join(" "));
        for action in &phase.actions {
            println!(
                "  {} [{}] type={} target={} timeout={}ms retries={}",
                action.id,
                action.name,
                action.action_type,
                action.output.target.as_str(),
                action.execution.timeout_ms,
                action.execution.retry_count
            );
        }
    }

    Ok(())
}

/// User input: JSON when it parses, otherwise the raw text.
fn parse_input(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

async fn cmd_run(path: &Path, args: RunArgs) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path)?;
    let pipeline_id = pipeline.id.clone();

    let config = match &args.config {
        Some(p) => EngineConfig::from_json_str(&std::fs::read_to_string(p)?)?,
        None => EngineConfig::default(),
    };
    let collaborators = match &args.directory {
        Some(p) => DirectoryFixtures::from_json_str(&std::fs::read_to_string(p)?)?.into_collaborators(),
        None => Collaborators::new(),
    };
    let llm: Arc<dyn LlmClient> = if args.dry_run {
        println!("(dry run mode -- no LLM calls)");
        Arc::new(EchoClient::with_prefix("[dry run] "))
    } else {
        Arc::new(OpenAiClient::from_env()?)
    };
    let engine = PipelineEngine::new(config, collaborators.with_llm(llm));

    if let Some(p) = &args.macros {
        let definitions: Vec<MacroDefinition> = serde_json::from_value(read_json(p)?)?;
        for definition in definitions {
            engine.register_macro(definition)?;
        }
    }
    for diag in engine.register_pipeline(pipeline)? {
        println!("{diag}");
    }

    let host_context = match &args.host_context {
        Some(p) => match read_json(p)? {
            Value::Object(map) => map,
            _ => anyhow::bail!("host context must be a JSON object"),
        },
        None => Map::new(),
    };

    let events = engine.subscribe();
    let console = tokio::spawn(answer_gavels(engine.clone(), events, args.auto_approve));

    println!("Running pipeline: {pipeline_id}");
    let options = RunOptions::new(parse_input(&args.input)).with_host_context(host_context);
    let result = engine.start_run_with(&pipeline_id, options).await;
    console.abort();
    let run = result?;

    println!("\nPipeline completed in {}ms", run.duration_ms());
    for phase in engine
        .get_pipeline(&pipeline_id)
        .map(|p| p.phases.clone())
        .unwrap_or_default()
    {
        if let Some(state) = run.phase(&phase.id) {
            let responses: usize = state.actions.values().map(|a| a.responses.len()).sum();
            println!("  {}: {} actions, {} responses", phase.id, state.actions.len(), responses);
        }
    }
    println!("\n{}", stringify(&run.final_output));

    Ok(())
}

/// Resolve gavels from the console as the engine requests them. An empty
/// line keeps the value under review.
async fn answer_gavels(
    engine: PipelineEngine,
    mut events: tokio::sync::broadcast::Receiver<PipelineEvent>,
    auto_approve: bool,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(event) = events.recv().await {
        let PipelineEvent::GavelRequested { key, prompt, value, .. } = event else {
            continue;
        };
        let decision = if auto_approve {
            value
        } else {
            println!("\n[gavel {key}] {prompt}\n{}", stringify(&value));
            println!("Enter a replacement (JSON or text), or press Enter to accept:");
            match lines.next_line().await {
                Ok(Some(line)) if !line.trim().is_empty() => parse_input(line.trim()),
                _ => value,
            }
        };

        let resolved = match key.split_once(':') {
            Some(("action", id)) => engine.resolve_action_gavel(id, decision),
            Some(("phase", id)) => engine.resolve_phase_gavel(id, decision),
            _ => continue,
        };
        if let Err(e) = resolved {
            tracing::warn!(gavel = %key, error = %e, "Could not resolve gavel");
        }
    }
}
