use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use gale::backend::file::JsonFileBackend;
use gale::backend::TaskBackend;
use gale::cli::StrategyRegistry;
use gale::config::EngineConfig;
use gale::health::{HealthChecker, HealthEvent};
use gale::hooks::HookSet;
use gale::scheduler::Scheduler;
use gale::session::SessionRecorder;

/// Process exit codes surfaced to the invoking shell.
const EXIT_OK: i32 = 0;
const EXIT_TASK_FAILED: i32 = 1;
const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_NO_HEALTHY_MODELS: i32 = 3;
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(
    name = "gale",
    about = "Drain a task queue through locally installed coding-assistant CLIs"
)]
struct Args {
    /// Namespace label attached to this run.
    namespace: Option<String>,

    /// Path to the TOML configuration file (default: gale.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker count override.
    #[arg(long)]
    parallel: Option<usize>,

    /// Stop after this many task completions.
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Task file override.
    #[arg(long)]
    tasks_file: Option<PathBuf>,

    /// Treat long-stuck in-progress tasks as pending.
    #[arg(long)]
    resume: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let code = match run(args).await {
        Ok(code) => code,
        // Everything that fails before the loop starts is a setup
        // problem; the loop itself reports through exit codes.
        Err(e) => {
            tracing::error!("{e:#}");
            EXIT_CONFIG_ERROR
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> anyhow::Result<i32> {
    let mut config =
        EngineConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(parallel) = args.parallel {
        config.engine.parallel = parallel;
    }
    if let Some(max_iterations) = args.max_iterations {
        config.engine.max_iterations = Some(max_iterations);
    }
    if let Some(ref tasks_file) = args.tasks_file {
        config.engine.tasks_file = tasks_file.display().to_string();
    }
    if args.resume {
        config.engine.resume = true;
    }
    let namespace = args
        .namespace
        .unwrap_or_else(|| config.engine.namespace.clone());

    anyhow::ensure!(
        !config.models.is_empty(),
        "no models configured; add [[models]] entries to gale.toml"
    );

    let backend: Arc<dyn TaskBackend> = if config.engine.resume {
        Arc::new(
            JsonFileBackend::open_resuming(&config.engine.tasks_file)
                .await
                .context("opening task backend")?,
        )
    } else {
        Arc::new(JsonFileBackend::new(&config.engine.tasks_file))
    };

    let ping = backend.ping().await;
    anyhow::ensure!(
        ping.ok,
        "task backend unreachable: {}",
        ping.error.unwrap_or_default()
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, draining workers");
                cancel.cancel();
            }
        });
    }

    // Pre-flight: probe every configured (CLI, model) pair.
    let strategies = StrategyRegistry::with_builtins();
    let paths = config.resolved_paths();
    let checker = HealthChecker::new(strategies.clone(), paths.clone(), config.health_config());

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let progress = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                HealthEvent::ModelHealthy(r) => {
                    tracing::info!(cli = %r.cli, model = %r.model, ms = r.validation_time_ms, "model healthy");
                }
                HealthEvent::ModelUnhealthy(r) => {
                    tracing::warn!(
                        cli = %r.cli,
                        model = %r.model,
                        error = r.last_error.as_deref().unwrap_or("unknown"),
                        "model unhealthy"
                    );
                }
                HealthEvent::ValidationComplete(s) => {
                    tracing::info!(
                        healthy = s.healthy,
                        unhealthy = s.unhealthy,
                        cache_cleared = s.cache_cleared,
                        "validation complete"
                    );
                }
            }
        }
    });

    let enabled: Vec<_> = config
        .model_registry()
        .list_enabled()
        .into_iter()
        .cloned()
        .collect();
    let report = checker.validate(&enabled, Some(events_tx), &cancel).await;
    let _ = progress.await;

    let no_healthy = report.healthy.is_empty();
    let selector = Arc::new(config.build_selector(report.healthy));

    let mut hooks = HookSet::new();
    hooks.register(Arc::new(SessionRecorder::new(SessionRecorder::DEFAULT_ROOT)));

    let scheduler = Scheduler::new(backend, selector, strategies, paths)
        .with_hooks(hooks)
        .with_cancellation(cancel.clone());

    let stats = scheduler.run_loop(&namespace, config.loop_config()).await;
    println!(
        "{namespace}: {} completed, {} failed in {}ms",
        stats.completed, stats.failed, stats.duration_ms
    );

    let code = if cancel.is_cancelled() {
        EXIT_CANCELLED
    } else if no_healthy {
        EXIT_NO_HEALTHY_MODELS
    } else if stats.failed > 0 {
        EXIT_TASK_FAILED
    } else {
        EXIT_OK
    };
    Ok(code)
}
