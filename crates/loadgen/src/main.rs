use anyhow::{Context, Result};
use clap::Parser;
use loadgen_core::{CleanupTracker, Config, Generator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod page;
mod web;

#[derive(Parser, Debug)]
#[command(name = "loadgen")]
#[command(about = "Load generator for the chat application stack")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/loadgen.yaml")]
    config: PathBuf,

    /// Start the web control plane and keep serving until killed
    #[arg(long)]
    web: bool,

    /// Number of virtual users for a headless run
    #[arg(long, default_value_t = 10)]
    users: usize,

    /// Duration of a headless run, e.g. 30s, 2m, 1h
    #[arg(long, default_value = "2m", value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Ramp-up rate in users per second, e.g. 5/s
    #[arg(long, default_value = "5/s")]
    ramp: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::load(&args.config));

    // The exposition endpoint serves both modes: the control plane scrapes
    // it for overviews and reports, and operators can point Prometheus at it.
    let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
    let metrics_listener = TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics endpoint on {metrics_addr}"))?;
    info!("metrics exposition on http://{metrics_addr}/metrics");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, web::metrics_router()).await {
            tracing::error!("metrics server exited: {e}");
        }
    });

    if args.web {
        web::serve(config).await
    } else {
        run_headless(config, args).await
    }
}

async fn run_headless(config: Arc<Config>, args: Args) -> Result<()> {
    info!(
        users = args.users,
        duration = ?args.duration,
        ramp = %args.ramp,
        "starting headless load test"
    );

    let cleanup = CleanupTracker::new(config.clone())?;
    let generator = Generator::new(
        config,
        args.users,
        args.duration,
        &args.ramp,
        cleanup.clone(),
    );
    generator.run(CancellationToken::new()).await;

    print_summary(&cleanup.tracked_users());
    Ok(())
}

fn print_summary(tracked: &[String]) {
    println!("\n=== Load Test Summary ===");
    println!("Tracked users: {}", tracked.len());
    if !tracked.is_empty() {
        println!("Users remain as persistent load; reduce via the control plane.");
    }
    println!();
}
