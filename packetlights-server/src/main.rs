use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use packetlights_core::{
    AnimationController, AttackMonitor, CancelToken, ControllerResponder, MemoryBackend,
    OutputBackend, PatternSet, PinDriver, StatusSnapshot,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

mod command_executor;
mod config;
mod gpio;
mod sse_server;
mod web_server;

use config::Config;
use gpio::PigpioBackend;
use sse_server::SseSender;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(version, about = "LED demo server driving a GPIO bank through pigpiod")]
struct Args {
    /// JSON config file; missing or invalid files fall back to defaults
    #[arg(short, long, default_value = "packetlights.json")]
    config: PathBuf,

    /// Keep the bank in memory instead of talking to pigpiod
    #[arg(long)]
    dry_run: bool,

    /// pigpiod address as host:port, overrides the config file
    #[arg(long)]
    pigpio: Option<String>,
}

/// Everything the HTTP handlers and background threads share
pub struct State {
    pub config: Config,
    pub controller: Arc<AnimationController>,
    pub monitor: AttackMonitor,
    pub patterns: PatternSet,
}

impl State {
    pub fn new(config: Config, backend: Arc<dyn OutputBackend>) -> Self {
        let driver = Arc::new(PinDriver::configure(backend, config.pins.clone()));
        let controller = Arc::new(AnimationController::new(driver));
        let patterns = PatternSet::new(
            controller.driver().len(),
            config.animation.clone(),
            config.leds.clone(),
        );
        let responder = Arc::new(ControllerResponder::new(controller.clone(), patterns.clone()));
        let monitor = AttackMonitor::new(config.monitor.clone(), responder);
        Self {
            config,
            controller,
            monitor,
            patterns,
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot::capture(&self.controller, &self.monitor)
    }
}

/// Apply the configured log level unless `RUST_LOG` already chose one
fn apply_log_level(config: &Config) {
    if std::env::var_os("RUST_LOG").is_some() {
        info!("Log level taken from RUST_LOG");
    } else {
        log::set_max_level(config.log_level.as_level_filter());
        info!("Log level set to {:?}", config.log_level);
    }
}

fn open_backend(args: &Args, config: &Config) -> Result<Arc<dyn OutputBackend>> {
    if args.dry_run {
        warn!("Dry run: GPIO writes stay in memory");
        return Ok(Arc::new(MemoryBackend::new()));
    }
    let address = args
        .pigpio
        .clone()
        .unwrap_or_else(|| config.pigpio.address());
    let timeout = Duration::from_millis(config.pigpio.connect_timeout_ms);
    info!("Connecting to pigpiod at {address}...");
    let backend = PigpioBackend::connect(&address, timeout)
        .with_context(|| format!("cannot reach pigpiod at {address} (is it running?)"))?;
    Ok(Arc::new(backend))
}

/// Let an alert end on its own once the cooldown passes
fn start_monitor_ticker(state: Arc<State>, shutdown: CancelToken) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("monitor".to_string())
        .spawn(move || {
            while !shutdown.sleep(TICK_INTERVAL) {
                state.monitor.poll();
            }
            debug!("Monitor ticker stopped");
        })
        .context("spawning monitor ticker")
}

/// Push a status snapshot to SSE clients once per tick
fn start_status_publisher(
    state: Arc<State>,
    sse_tx: SseSender,
    shutdown: CancelToken,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("status".to_string())
        .spawn(move || {
            while !shutdown.sleep(TICK_INTERVAL) {
                let json = match serde_json::to_string(&state.status()) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Status serialization failed: {e}");
                        continue;
                    }
                };
                if !sse_server::publish(&sse_tx, json) {
                    break;
                }
            }
            debug!("Status publisher stopped");
        })
        .context("spawning status publisher")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Ctrl-C handler failed: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("SIGTERM handler failed: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Ctrl-C received"),
        () = terminate => info!("SIGTERM received"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let config = Config::load_or_default(&args.config);
    apply_log_level(&config);

    info!("Starting packetlights...");
    debug!("Config: {config:?}");

    let backend = open_backend(&args, &config)?;
    let state = Arc::new(State::new(config, backend));

    let shutdown = CancelToken::new();
    let mut workers = vec![start_monitor_ticker(state.clone(), shutdown.clone())?];

    // SSE is optional: the page falls back to polling /status
    match sse_server::start_sse_server(&state.config.http.host, state.config.sse_port) {
        Ok((sse_tx, _)) => {
            workers.push(start_status_publisher(state.clone(), sse_tx, shutdown.clone())?);
        }
        Err(e) => error!("SSE server failed to start on port {}: {e}", state.config.sse_port),
    }

    if state.controller.start(state.patterns.normal()) {
        info!("Normal chase running at {} Hz", state.config.animation.chase_hz);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let served = runtime.block_on(async {
        let address = format!("{}:{}", state.config.http.host, state.config.http.port);
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .with_context(|| format!("binding {address}"))?;
        info!("Web server listening on http://{address}");
        axum::serve(listener, web_server::router(state.clone()))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("web server")
    });

    info!("Shutting down, blanking the LED bank");
    shutdown.cancel();
    // The ticker may restart the normal chase, so it must be gone before the final stop
    for worker in workers {
        if worker.join().is_err() {
            warn!("Background thread panicked");
        }
    }
    state.controller.stop();
    served
}
