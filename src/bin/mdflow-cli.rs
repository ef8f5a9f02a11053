//! mdflow CLI - Command-line interface for the mdflow runtime
//!
//! Provides subcommands for checking documents and running them against the
//! offline echo completion service.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use mdflow::runtime::{
    EchoCompletion, ExecuteOptions, FlowFiles, Runtime, RuntimeConfig, RuntimeError,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "mdflow")]
#[command(about = "Compile and run directive-extended Markdown", long_about = None)]
struct Cli {
    /// JSON runtime configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a document and report diagnostics
    Check {
        /// Document path
        file: PathBuf,
    },

    /// Run a document and print each rendered node
    Run {
        /// Document path
        file: PathBuf,

        /// Input value as name=value (repeatable)
        #[arg(short, long = "input")]
        inputs: Vec<String>,

        /// Directory of documents reachable by flow
        #[arg(long)]
        flows: Option<PathBuf>,

        /// Abort after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Run each flow in its own scope
        #[arg(long)]
        scoping: bool,

        /// Print nodes as JSON instead of text
        #[arg(long)]
        json: bool,

        /// Print the state history after the run
        #[arg(long)]
        history: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig> {
    let Some(path) = path else {
        return Ok(RuntimeConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

fn parse_input(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("input '{}' is not name=value", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.trim().to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let runtime = Runtime::new(Arc::new(EchoCompletion)).with_config(config);

    match cli.command {
        Commands::Check { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let output = runtime.compile(&content, &[]);
            for diagnostic in output.diagnostics() {
                let (line, column) = diagnostic.line_col(&content);
                println!("{}:{}:{}: {}", file.display(), line, column, diagnostic);
            }
            println!(
                "{} blocks, {} errors, {} warnings",
                output.document.blocks.len(),
                output.errors.len(),
                output.warnings.len()
            );
            if output.has_errors() {
                std::process::exit(1);
            }
        }

        Commands::Run {
            file,
            inputs,
            flows,
            timeout,
            scoping,
            json,
            history,
        } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let mut options = ExecuteOptions::default();
            options.settings.use_scoping = scoping;
            for raw in &inputs {
                let (name, value) = parse_input(raw)?;
                options.input.insert(name, value);
            }
            if let Some(dir) = flows {
                options.files = FlowFiles::from_dir(&dir)
                    .with_context(|| format!("loading flows from {}", dir.display()))?;
            }
            if let Some(seconds) = timeout {
                options.timeout = Some(Duration::from_secs(seconds));
            }

            let mut execution = runtime.execute(&content, options)?;
            let state = execution.state();
            let mut failure: Option<RuntimeError> = None;
            while let Some(item) = execution.next().await {
                match item {
                    Ok(node) if json => println!("{}", serde_json::to_string(&node)?),
                    Ok(node) => println!("{}", node.text_content()),
                    Err(err) => failure = Some(err),
                }
            }

            if history {
                for block in state.history() {
                    println!("{:>4} {} {}", block.index, &block.hash[..12], block.action);
                }
                state.verify_history()?;
            }
            if let Some(err) = failure {
                return Err(err.into());
            }
        }
    }

    Ok(())
}
