use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use murmur_gateway::api::{ApiServer, ApiState};
use murmur_gateway::config::Overrides;
use murmur_gateway::Config;

/// Murmur - real-time voice assistant gateway
#[derive(Parser)]
#[command(name = "murmur", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    overrides: Overrides,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before parsing so env fallbacks see it
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Set up logging based on verbosity, RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,murmur_gateway=info",
        1 => "info,murmur_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.overrides)?;
    tracing::info!(port = config.port, "starting murmur gateway");

    let backends = config.build_backends();
    let state = Arc::new(ApiState::new(backends, config.session_settings()));
    let server = ApiServer::new(state, config.port, Some(config.static_dir.clone()));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        signal.cancel();
    });

    server.run(shutdown).await?;
    Ok(())
}
