use clap::Parser;
use gateway::config::{self, Config, LogFormat, LOG_OUTPUT_FILE};
use gateway::http::{self, HttpState};
use gateway::supervisor::Supervisor;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gateway", about = "BACnet presence gateway")]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "/etc/bacnet-gateway/gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Config load failures go straight to stderr (no subscriber exists
    // yet — the [logging] section that would configure one hasn't been
    // read). Tracing is initialized from the loaded config below.
    let cfg = match config::load_config_from_path(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");
    info!(
        device_instance = cfg.server.device_instance,
        devices = cfg.devices.len(),
        "config loaded"
    );

    // spec.md §6: processing-latency and read-latency histograms each carry
    // their own fixed bucket set rather than the exporter's default ladder.
    let prometheus = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_processing_latency_ms".to_owned()),
            &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0],
        )
        .unwrap_or_else(|e| {
            eprintln!("FATAL: failed to configure metrics buckets: {e}");
            std::process::exit(1);
        })
        .set_buckets_for_metric(
            Matcher::Full("gateway_read_latency_ms".to_owned()),
            &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0],
        )
        .unwrap_or_else(|e| {
            eprintln!("FATAL: failed to configure metrics buckets: {e}");
            std::process::exit(1);
        })
        .install_recorder()
        .unwrap_or_else(|e| {
            eprintln!("FATAL: failed to install metrics recorder: {e}");
            std::process::exit(1);
        });

    let health_cfg = cfg.health.clone();
    let mut supervisor = match Supervisor::startup(cfg).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("FATAL: failed to start supervisor: {e}");
            std::process::exit(1);
        }
    };

    let http_state = HttpState {
        shared: supervisor.shared(),
        prometheus,
    };
    let addr = format!("{}:{}", health_cfg.bind_address, health_cfg.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: failed to bind health/metrics listener on {addr}: {e}");
            std::process::exit(1);
        }
    };
    let http_router = http::router(http_state);
    let http_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, http_router).await {
            tracing::error!(error = %e, "health/metrics server exited");
        }
    });
    info!(addr, "health/metrics listening");

    supervisor.run().await;

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");

    supervisor.shutdown().await;
    http_task.abort();
}

/// Builds the tracing subscriber from `[logging]`: stdout and/or a rolling
/// file sink per `outputs`, text or JSON formatting, colorized only when
/// both requested and writing to stdout. Syslog output and size-based
/// rotation are recognized in config but not implemented here — the logging
/// backend itself is an out-of-scope external collaborator (spec.md §1).
/// Returns the file appender's guard; it must be held for the process
/// lifetime or buffered lines are dropped on exit.
fn init_logging(cfg: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.clone()));
    let json = cfg.logging.format == LogFormat::Json;

    fn boxed_layer<W>(
        writer: W,
        json: bool,
        ansi: bool,
    ) -> Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync>
    where
        W: for<'writer> fmt::MakeWriter<'writer> + Send + Sync + 'static,
    {
        if json {
            fmt::layer().with_writer(writer).json().boxed()
        } else {
            fmt::layer().with_writer(writer).with_ansi(ansi).boxed()
        }
    }

    let mut layers: Vec<Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync>> = Vec::new();
    if cfg.logging.outputs & config::LOG_OUTPUT_STDOUT != 0 {
        layers.push(boxed_layer(std::io::stdout, json, cfg.logging.colorize));
    }

    let mut guard = None;
    if cfg.logging.outputs & LOG_OUTPUT_FILE != 0 {
        if let Some(path) = &cfg.logging.file {
            let path = std::path::Path::new(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("gateway.log"));
            let appender = tracing_appender::rolling::daily(dir, filename);
            let (non_blocking, g) = tracing_appender::non_blocking(appender);
            guard = Some(g);
            layers.push(boxed_layer(non_blocking, json, false));
        }
    }

    tracing_subscriber::registry().with(filter).with(layers).init();
    guard
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
