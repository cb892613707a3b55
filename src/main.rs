use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use webprobe::config::{AgentConfig, TestSettings};
use webprobe::loader::load_settings_from_file;
use webprobe::progress::TracingObserver;
use webprobe::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use webprobe::{standard_template, TestAgent};

#[derive(Parser)]
#[command(name = "webprobe")]
#[command(about = "Synthetic monitoring checks for a single URL", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs DNS, reachability, HTTP and status checks and prints the session
    Check {
        /// URL under test
        #[arg(short, long)]
        url: String,

        /// JSON settings file (defaults + WEBPROBE_* overrides when absent)
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Write the session JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep running after a failed step
        #[arg(long)]
        continue_on_failure: bool,
    },
    /// Checks the pipeline wiring against a URL without reporting a session
    Probe {
        #[arg(short, long)]
        url: String,

        #[arg(short, long)]
        settings: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_telemetry(TelemetryConfig::from_env()) {
        eprintln!("❌ Failed to initialise telemetry: {:#}", e);
    }

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::from(2)
        }
    };

    shutdown_telemetry();
    code
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Check {
            url,
            settings,
            output,
            continue_on_failure,
        } => {
            let settings = load_settings(settings.as_ref())?;
            let mut config = AgentConfig::from_env();
            config.continue_on_failure |= continue_on_failure;

            let agent = TestAgent::new(config)
                .with_template(standard_template()?)
                .with_observer(Arc::new(TracingObserver));
            let session = agent.run(&url, settings, cancel_on_ctrl_c()).await;

            let json = session.to_json_pretty()?;
            match output {
                Some(path) => {
                    fs::write(&path, json)?;
                    info!(path = ?path, "📄 Session saved");
                }
                None => println!("{}", json),
            }

            Ok(if session.validity() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Probe { url, settings } => {
            let settings = load_settings(settings.as_ref())?;
            let agent = TestAgent::new(AgentConfig::from_env()).with_template(standard_template()?);

            let ok = agent.probe(&url, settings, cancel_on_ctrl_c()).await;
            println!("{}", if ok { "probe ok" } else { "probe failed" });
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<TestSettings> {
    match path {
        Some(path) => load_settings_from_file(path),
        None => Ok(TestSettings::from_env()),
    }
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling run");
            child.cancel();
        }
    });
    token
}
