#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use clinical_contrast::config::{PipelineConfig, Step};
use clinical_contrast::pipeline::{config_hash, Pipeline};

#[derive(Parser)]
#[command(name = "contrast", version, about = "Clinical contrast-set benchmark builder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured pipeline steps
    Run {
        /// Pipeline config (JSON)
        #[arg(long)]
        config: PathBuf,
        /// Input questions (JSON array or JSONL); for a later first step, a stage output file
        #[arg(long)]
        input: Option<PathBuf>,
        /// Override the configured steps, e.g. `sample,rewrite,finalize`
        #[arg(long, value_delimiter = ',')]
        steps: Option<Vec<Step>>,
        /// Reuse records already present in stage outputs
        #[arg(long)]
        resume: bool,
        /// Write the run report here instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Parse and validate a config, then print it with defaults filled in
    ValidateConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            input,
            steps,
            resume,
            report,
        } => {
            let mut config = PipelineConfig::load(&config)?;
            if let Some(steps) = steps {
                config.steps = steps;
            }
            config.resume |= resume;
            config.validate()?;

            let pipeline = Pipeline::from_env(config)?;
            let abort = pipeline.abort_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, finishing in-flight questions");
                    abort.store(true, Ordering::SeqCst);
                }
            });

            let run_report = pipeline.run(input.as_deref()).await?;
            let json = serde_json::to_string_pretty(&run_report)?;
            match report {
                Some(path) => std::fs::write(path, json)?,
                None => writeln!(io::stdout(), "{json}")?,
            }
        }
        Commands::ValidateConfig { config } => {
            let config = PipelineConfig::load(&config)?;
            let mut stdout = io::stdout();
            writeln!(stdout, "{}", serde_json::to_string_pretty(&config)?)?;
            writeln!(stdout, "config_hash: {}", config_hash(&config))?;
        }
    }

    Ok(())
}
