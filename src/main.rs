//! Polaris camera server: liveview relay and still pictures over HTTP

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use polaris::capture::CameraSource;
use polaris::pipeline::{LiveViewWorker, WorkerSettings};
use polaris::server::{self, AppState};
use polaris::Config;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:8000
    #[arg(short, long)]
    bind: Option<String>,

    /// Replay a recorded MJPEG file instead of driving a camera
    #[arg(long, value_name = "FILE")]
    fake: Option<PathBuf>,

    /// Replay rate for --fake
    #[arg(long)]
    fps: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("polaris=info,tower_http=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(args.config.as_deref()).wrap_err("loading configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(path) = args.fake {
        config.use_recording(path);
    }
    if let Some(fps) = args.fps {
        config.source.fps = fps;
    }

    info!("Polaris Launching...");
    info!("Camera source: {:?}", config.source.kind);

    let source = CameraSource::from_config(&config.source, &config.liveview)?;
    let worker = Arc::new(LiveViewWorker::new(
        source,
        WorkerSettings::from(&config.liveview),
        tokio::runtime::Handle::current(),
    ));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .wrap_err_with(|| format!("binding {}", config.server.bind))?;

    let grace = config.liveview.terminate_timeout() + Duration::from_secs(2);
    let state = AppState::new(Arc::clone(&worker), config);
    server::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Interrupted");
    })
    .await?;

    // Make sure the camera process is gone before exiting
    worker.shutdown(grace).await;

    info!("Polaris shutting down");
    Ok(())
}
