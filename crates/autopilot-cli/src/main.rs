use anyhow::Result;
use autopilot_runner::checkpoint::CandidateScores;
use autopilot_runner::{config, IterationResult, Orchestrator, ProjectLayout, RunMode, RunRegistry};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "autopilot",
    version = "0.3.0",
    about = "Iterative training autopilot for the drone pick-and-place environment"
)]
struct Cli {
    /// Project root holding autopilot.yaml, configs/, runs/ and friends.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "quick")]
    Quick,
    #[value(name = "full")]
    Full,
}

impl From<ModeArg> for RunMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Quick => RunMode::Quick,
            ModeArg::Full => RunMode::Full,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more training iterations.
    Run {
        #[arg(long, default_value_t = 1)]
        runs: u32,
        #[arg(long, value_enum, default_value_t = ModeArg::Quick)]
        mode: ModeArg,
        #[arg(long)]
        json: bool,
    },
    /// List recorded runs, oldest first.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show the best-checkpoint record.
    Best {
        #[arg(long)]
        json: bool,
    },
    /// Print a config document as trainer command-line flags.
    RenderArgs {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    tracing::debug!(root = %cli.root.display(), json_mode, "starting command");
    let result = run_command(&cli.root, cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_command(root: &Path, command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { runs, mode, json } => {
            let orchestrator = Orchestrator::open(root)?;
            let mode = RunMode::from(mode);
            let results = orchestrator.run_session(runs, mode)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "mode": mode.as_str(),
                    "iterations": results.iter().map(iteration_to_json).collect::<Vec<_>>()
                })));
            }
            for result in &results {
                print_iteration(&orchestrator, result);
            }
        }
        Commands::List { json } => {
            let layout = ProjectLayout::open(root)?;
            let registry = RunRegistry::new(layout.runs_dir.clone());
            let runs = registry.list()?;
            if json {
                let rows: Vec<Value> = runs
                    .iter()
                    .map(|run| {
                        json!({
                            "run_id": run.run_id,
                            "run_dir": run.dir.display().to_string(),
                            "complete": run.is_complete(),
                        })
                    })
                    .collect();
                return Ok(Some(json!({"ok": true, "command": "list", "runs": rows})));
            }
            if runs.is_empty() {
                println!("no runs recorded in {}", layout.runs_dir.display());
            }
            for run in &runs {
                let status = if run.is_complete() { "complete" } else { "incomplete" };
                println!("{}  {}", run.run_id, status);
            }
        }
        Commands::Best { json } => {
            let orchestrator = Orchestrator::open(root)?;
            let record = orchestrator.state().read_best_record();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "best",
                    "best": record
                })));
            }
            match record {
                Some(best) => {
                    println!("run_id: {}", best.run_id);
                    println!("model_path: {}", best.model_path);
                    println!("primary_score: {}", fmt_opt(best.primary_score));
                    println!("mean_reward: {}", fmt_opt(best.mean_reward));
                    println!("timestamp: {}", best.timestamp);
                }
                None => println!("no best checkpoint recorded yet"),
            }
        }
        Commands::RenderArgs { config: path, json } => {
            let doc = config::load(&path)?;
            let argv = config::render_cli_args(&doc);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "render-args",
                    "args": argv
                })));
            }
            println!("{}", argv.join(" "));
        }
    }
    Ok(None)
}

fn iteration_to_json(result: &IterationResult) -> Value {
    json!({
        "run_id": result.run.run_id,
        "run_dir": result.run.dir.display().to_string(),
        "metrics": result.metrics,
        "primary_score": CandidateScores::from_metrics(&result.metrics).primary(),
        "checkpoint": result.checkpoint.as_ref().map(|p| p.display().to_string()),
        "promoted": result.promoted,
        "analysis": result.analysis,
    })
}

fn print_iteration(orchestrator: &Orchestrator, result: &IterationResult) {
    let scores = CandidateScores::from_metrics(&result.metrics);
    println!("run_id: {}", result.run.run_id);
    println!(
        "run_dir: {}",
        orchestrator.layout().display_path(&result.run.dir)
    );
    println!("primary_score: {}", fmt_opt(scores.primary()));
    println!("mean_reward: {}", fmt_opt(scores.mean_reward));
    match &result.checkpoint {
        Some(path) => println!(
            "checkpoint: {}{}",
            path.display(),
            if result.promoted { " (new best)" } else { "" }
        ),
        None => println!("checkpoint: none"),
    }
    println!("analysis: {}", result.analysis.severity.as_str());
    for message in result.analysis.messages() {
        println!("  - {}", message);
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.4}", v))
        .unwrap_or_else(|| "n/a".to_string())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::List { json }
        | Commands::Best { json }
        | Commands::RenderArgs { json, .. } => *json,
    }
}
