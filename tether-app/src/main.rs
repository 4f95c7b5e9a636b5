//! Tether host entry point.
//!
//! ## Modes
//!
//! - default: serve the sample channels to an in-process UI context and run
//!   the renderer walkthrough against it.
//! - `--stdio`: serve one UI context over stdin/stdout as newline-delimited
//!   JSON envelopes. Logs go to stderr in both modes.
//!
//! The runtime is `current_thread`: handlers interleave at await points on a
//! single thread.

mod channels;
mod demo;
mod settings;

use std::time::Duration;

use anyhow::Context;
use settings::AppSettings;
use tether_core::Controller;
use tracing::info;

/// Ticker events the walkthrough waits for before exiting.
const DEMO_UPDATES: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Demo,
    Stdio,
}

fn parse_mode() -> anyhow::Result<Mode> {
    let mut mode = Mode::Demo;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--stdio" => mode = Mode::Stdio,
            "--demo" => mode = Mode::Demo,
            other => anyhow::bail!("unknown argument `{other}` (expected --demo or --stdio)"),
        }
    }
    Ok(mode)
}

fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tether=info")),
        )
        .init();

    let mode = parse_mode()?;
    info!(?mode, "Tether starting");

    let settings_path = AppSettings::path();
    let app_settings = AppSettings::load_or_init(&settings_path);
    info!(
        settings_path = ?settings_path,
        invoke_timeout_ms = app_settings.invoke_timeout_ms,
        ticker_interval_ms = app_settings.ticker_interval_ms,
        "runtime settings loaded"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(run(mode, app_settings))
}

async fn run(mode: Mode, app_settings: AppSettings) -> anyhow::Result<()> {
    // ── Controller setup ──────────────────────────────────────────────────
    let registry = channels::build_registry().context("building channel registry")?;
    let controller = Controller::new(registry, app_settings.controller_config())
        .context("starting controller")?;
    channels::register_handlers(&controller, &app_settings).context("registering handlers")?;
    let ticker = channels::spawn_ticker(controller.clone(), app_settings.ticker_interval());

    let outcome = match mode {
        Mode::Demo => run_demo(&controller).await,
        Mode::Stdio => serve_stdio(&controller).await,
    };

    let cancelled = controller.shutdown();
    ticker.abort();
    info!(cancelled, "Tether stopped");
    outcome
}

async fn run_demo(controller: &Controller) -> anyhow::Result<()> {
    let bridge = controller.attach().context("attaching demo context")?;
    tokio::select! {
        result = demo::run(&bridge, DEMO_UPDATES) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    }
}

async fn serve_stdio(controller: &Controller) -> anyhow::Result<()> {
    let id = controller
        .attach_stream(tokio::io::stdin(), tokio::io::stdout())
        .context("attaching stdio context")?;
    info!(%id, "serving UI context on stdio");

    let detached = async {
        while controller.contexts().contains(&id) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };
    tokio::select! {
        _ = detached => info!(%id, "stdio context closed"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    Ok(())
}
