mod detector;
mod http;
mod ptz;
mod scene;

use anyhow::{Context, Result};
use camwatch_orchestrator::config::{NodeConfig, PtzProtocol, StreamConfig};
use camwatch_orchestrator::{EventHub, LogNotifier, Metrics, StreamManager, TracingSink};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use detector::NoisyDetector;
use scene::{CameraProfile, SimConnector};

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs the stream orchestrator against simulated cameras", long_about = None)]
struct Args {
    /// Node config file; a built-in two-camera scene is used when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Stop after this many seconds instead of waiting for a signal
    #[arg(short, long)]
    duration_secs: Option<u64>,

    /// Per-frame probability of a simulated camera outage
    #[arg(long, default_value_t = 0.002)]
    outage_rate: f64,

    /// Sweep every PTZ camera over its patrol grid
    #[arg(long)]
    patrol: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let node = match &args.config {
        Some(path) => NodeConfig::load(path).with_context(|| format!("loading {}", path))?,
        None => builtin_scene(),
    };
    info!(node_id = %node.node_id, streams = node.streams.len(), "Starting camwatch simulator");

    let metrics = Arc::new(Metrics::new()?);
    let metrics_server = if node.monitoring.enable_metrics {
        Some(http::start_metrics_server(node.monitoring.metrics_port, metrics.clone())?)
    } else {
        None
    };

    let hub = EventHub::builder(node.pipeline.fanout_capacity)
        .sink("log", Arc::new(TracingSink))
        .notifier("log", Arc::new(LogNotifier))
        .build(metrics.clone());

    let profiles = node
        .streams
        .iter()
        .map(|stream| CameraProfile {
            camera_id: stream.camera_id.clone(),
            source_uri: stream.source_uri.clone(),
            fps: 15,
            targets: 3,
            outage_rate: args.outage_rate,
            freeze_rate: args.outage_rate / 2.0,
        })
        .collect();

    let manager = StreamManager::new(
        &node,
        Arc::new(SimConnector::new(profiles)),
        Arc::new(NoisyDetector::default()),
        hub,
        metrics,
    );

    for stream in node.streams.iter().cloned() {
        let sweeps = args.patrol && stream.ptz.protocol != PtzProtocol::None;
        let stream_id = manager.register(stream)?;
        manager.start(&stream_id).await?;
        if sweeps {
            manager.start_patrol(&stream_id).await?;
        }
    }

    let report = async {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let statuses = manager.list();
            let running = statuses.iter().filter(|s| s.state.is_running()).count();
            info!(running, total = statuses.len(), "Node status");
            for status in statuses {
                info!(
                    stream_id = %status.stream_id,
                    state = %status.state,
                    fps = status.fps,
                    frames = status.frames_received,
                    dropped = status.frames_dropped,
                    attempt = status.reconnect_attempt,
                    patrol = status.patrol_active,
                    "Stream status"
                );
            }
        }
    };

    tokio::select! {
        _ = wait_for_shutdown(args.duration_secs) => {},
        _ = report => {},
    }

    manager.shutdown().await;
    if let Some(server) = metrics_server {
        server.stop(true).await;
    }
    for status in manager.list() {
        match serde_json::to_string(&status) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(stream_id = %status.stream_id, error = %e, "Status not serializable"),
        }
    }
    info!("Simulator stopped");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// A fixed lobby camera and a PTZ yard camera that autotracks people.
fn builtin_scene() -> NodeConfig {
    let mut lobby = StreamConfig::new("cam-lobby", "sim://lobby");
    lobby.stream_id = Some("lobby".to_string());
    lobby.name = "Lobby".to_string();
    lobby.allowed_classes = vec!["person".to_string()];

    let mut yard = StreamConfig::new("cam-yard", "sim://yard");
    yard.stream_id = Some("yard".to_string());
    yard.name = "Yard".to_string();
    yard.autotrack_enabled = true;
    yard.ptz.protocol = PtzProtocol::Onvif;
    yard.backoff.max_consecutive_failures = Some(20);
    yard.patrol.dwell_ms = 3_000;
    yard.patrol.home_rest_ms = 10_000;

    NodeConfig {
        node_id: "sim-node".to_string(),
        streams: vec![lobby, yard],
        ..NodeConfig::default()
    }
}

async fn wait_for_shutdown(limit: Option<u64>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let deadline = async {
        match limit {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = deadline => {},
    }

    info!("Shutdown signal received");
}
