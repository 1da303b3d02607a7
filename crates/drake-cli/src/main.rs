//! Drake CLI tool.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "drake")]
#[command(about = "Unified, container-aware task execution", version)]
struct Cli {
    /// Location of the drake configuration
    #[arg(long, short = 'f', global = true, default_value = "Drakefile.yaml")]
    file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute drake target(s) or pipeline(s)
    Run {
        /// Names of the targets (or, with --pipeline, pipelines) to execute
        #[arg(required = true)]
        names: Vec<String>,
        /// Execute pipeline(s) instead of target(s)
        #[arg(long, short = 'p')]
        pipeline: bool,
        /// Display the execution plan without running anything
        #[arg(long, short = 'd')]
        debug: bool,
        /// Run the targets of each stage concurrently
        #[arg(long, short = 'c')]
        concurrently: bool,
        /// Location of a KEY=VALUE secrets file
        #[arg(long, short = 's')]
        secrets: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Run {
            names,
            pipeline,
            debug,
            concurrently,
            secrets,
        } => {
            commands::run(
                &cli.file,
                &names,
                pipeline,
                debug,
                concurrently,
                secrets.as_deref(),
            )
            .await
        }
    };

    if let Err(err) = outcome {
        eprintln!("{err}");
        // A target that exited non-zero dictates the process exit code.
        let code = match &err {
            drake_core::Error::TargetFailed { code, .. } => i32::try_from(*code).unwrap_or(1),
            _ => 1,
        };
        std::process::exit(code);
    }
}
