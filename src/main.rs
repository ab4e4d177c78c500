use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codekb::config::Config;
use codekb::db::Db;
use codekb::db::models::ChunkLevel;
use codekb::pipeline::{Pipeline, PipelineOptions, RunHistory, RunState, RunStatus, Step};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codekb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (JSON, or YAML by extension)
    #[arg(short, long, global = true, default_value = "")]
    config: String,

    /// Overrides the configured context
    #[arg(long, global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run extract followed by fix-links, or a single step
    Index {
        #[arg(long)]
        step: Option<Step>,

        /// Overrides the configured source root
        #[arg(long)]
        root: Option<String>,
    },

    /// Show store totals for the context
    Status,

    /// Show recorded run snapshots
    History {
        #[arg(long, default_value = "extract")]
        step: Step,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Collect identities no source chunk refers to
    Gc,

    /// Remove one indexed unit and everything derived from it
    Remove { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(context) = cli.context {
        config.context = context;
    }
    if let Commands::Index { root: Some(root), .. } = &cli.command {
        config.root = root.clone();
    }
    config.validate().context("Invalid configuration")?;

    let db = Db::open(&config.db_path).context("Failed to open database")?;
    let context = config.context.clone();

    match cli.command {
        Commands::Index { step, .. } => {
            let provider = config.directory_provider()?;
            let pipeline = Pipeline::new(db.into_shared(), Arc::new(provider), PipelineOptions::from_config(&config));
            run_index(&pipeline, &context, step).await?;
        }
        Commands::Status => {
            let files = db.list_files(&context)?;
            println!("context:     {context}");
            println!("files:       {}", files.len());
            println!("identities:  {}", db.count_identities(&context)?);
            println!("chunks:      {}", db.count_chunks(&context, None)?);
            println!("  source:    {}", db.count_chunks(&context, Some(ChunkLevel::Source))?);
            println!("  relations: {}", db.count_chunks(&context, Some(ChunkLevel::Relations))?);
            println!("links:       {}", db.count_links(&context)?);
        }
        Commands::History { step, limit } => {
            let Some(path) = &config.history.path else {
                anyhow::bail!("history.path is not configured; history is only kept in memory");
            };
            let history = RunHistory::with_path(config.history.capacity, path);
            for state in history.recent(&context, step, limit) {
                println!("{}", serde_json::to_string(&summary(&state))?);
            }
        }
        Commands::Gc => {
            let mut db = db;
            let collected = db.gc_identities(&context)?;
            for identity in &collected {
                println!("{} ({})", identity.full_name, identity.kind);
            }
            info!("Collected {} identities", collected.len());
        }
        Commands::Remove { name } => {
            let provider = config.directory_provider()?;
            let pipeline = Pipeline::new(db.into_shared(), Arc::new(provider), PipelineOptions::from_config(&config));
            match pipeline.remove_unit(&context, &name).await? {
                Some(collected) => info!("Removed {name}, collected {collected} identities"),
                None => anyhow::bail!("{name} is not indexed in {context}"),
            }
        }
    }

    Ok(())
}

async fn run_index(pipeline: &Pipeline, context: &str, step: Option<Step>) -> Result<()> {
    let handle = match step {
        Some(step) => pipeline.start_step(context, step).await?,
        None => pipeline.start_run(context).await?,
    };
    info!("Run {} accepted", handle.session_id);

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {msg:10} {bar:40.cyan/blue} {pos}/{len} ({percent}%)")
            .context("invalid progress template")?
            .progress_chars("█▓░"),
    );

    let steps: Vec<Step> = match step {
        Some(step) => vec![step],
        None => vec![Step::Extract, Step::FixLinks],
    };
    let mut task = tokio::spawn(handle.wait());
    let last = loop {
        tokio::select! {
            done = &mut task => break done??,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                for step in &steps {
                    let state = pipeline.get_status(context, *step).await;
                    if state.status == RunStatus::Running {
                        pb.set_message(step.to_string());
                        pb.set_length(state.total_items as u64);
                        pb.set_position(state.items_processed as u64);
                    }
                }
            }
        }
    };
    pb.finish_and_clear();

    for step in &steps {
        let state = pipeline.get_status(context, *step).await;
        println!("{}", serde_json::to_string_pretty(&summary(&state))?);
    }
    if last.status == RunStatus::Failed {
        anyhow::bail!(
            "{} failed: {}",
            last.step,
            last.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// A run state without its step log and per-unit detail.
fn summary(state: &RunState) -> serde_json::Value {
    let mut value = serde_json::json!({
        "context": state.context,
        "step": state.step,
        "status": state.status,
        "progress": state.progress,
        "items_processed": state.items_processed,
        "total_items": state.total_items,
        "started_at": state.started_at,
        "completed_at": state.completed_at,
        "error": state.error,
    });
    if let Some(report) = &state.report {
        if let Some(extract) = report.as_extract() {
            value["totals"] = serde_json::json!(extract.totals);
            value["lineage"] = serde_json::json!(extract.lineage);
            value["errors"] = serde_json::json!(extract.errors);
        }
        if let Some(fix) = report.as_fix_links() {
            value["rewritten"] = serde_json::json!(fix.rewritten.len());
            value["missing"] = serde_json::json!(fix.missing.len());
            value["ambiguous"] = serde_json::json!(fix.ambiguous);
            value["unqualified_identities"] = serde_json::json!(fix.unqualified_identities);
        }
    }
    value
}
