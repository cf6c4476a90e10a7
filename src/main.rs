//! `git-mirrord`: the daemon binary. Loads a configuration document,
//! reconciles it into a [`Pool`], runs (or starts looping) the engines, and
//! optionally watches the config file for changes.

use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;

use git_mirror::engine::EngineDeps;
use git_mirror::metrics::{LoggingMetricsSink, MetricsSink};
use git_mirror::pool::Pool;
use git_mirror::reconciler::Reconciler;

#[derive(Parser)]
#[command(name = "git-mirrord", version, about = "Mirrors remote git repositories and publishes pinned worktree checkouts")]
struct Cli {
    /// Minimum log level: error, warn, info, debug, trace.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Path to the YAML configuration document.
    #[arg(long = "config")]
    config: Utf8PathBuf,

    /// Re-read and reconcile `--config` whenever it changes on disk.
    #[arg(long = "watch-config", default_value_t = false)]
    watch_config: bool,

    /// Address to bind the (not-yet-implemented) metrics/health HTTP
    /// endpoint to; accepted and logged for forward compatibility with
    /// process-level monitoring, since HTTP serving is a process-level
    /// concern left out of this daemon's core.
    #[arg(long = "http-bind-address")]
    http_bind_address: Option<String>,

    /// Run one `MirrorAll` pass against every configured repository, then
    /// exit instead of starting the periodic loops.
    #[arg(long = "one-time", default_value_t = false)]
    one_time: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&cli.log_level),
    )
    .init();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    if cli.http_bind_address.is_some() {
        log::info!(
            "http-bind-address {:?} accepted but not served by this process; \
             wire up a metrics/health endpoint at the process level",
            cli.http_bind_address
        );
    }

    let metrics: Arc<dyn MetricsSink> = Arc::new(LoggingMetricsSink);
    let reconciler = Reconciler::new({
        let metrics = metrics.clone();
        move || EngineDeps {
            metrics: metrics.clone(),
            ..EngineDeps::default()
        }
    });

    let pool = Arc::new(Pool::new());

    let text = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {}", cli.config))?;
    let config = reconciler
        .prepare(&text)
        .context("initial configuration is invalid")?;
    reconciler
        .reconcile(&pool, &config)
        .context("initial reconciliation failed")?;

    let initial_result = pool.mirror_all();
    metrics.set_last_reload_success(
        "<initial>",
        initial_result.is_ok(),
        unix_now(),
    );

    if cli.one_time {
        return Ok(match initial_result {
            Ok(()) => ExitCode::SUCCESS,
            Err(_) => ExitCode::FAILURE,
        });
    }

    if let Err(e) = initial_result {
        log::warn!("initial MirrorAll reported failures, continuing into the loop: {e}");
    }

    pool.start_loop();

    if cli.watch_config {
        watch_config(cli.config.clone(), pool.clone(), reconciler, metrics.clone());
    }

    Ok(wait_for_shutdown(&pool))
}

/// Blocks until two termination signals have been observed: the first
/// triggers graceful shutdown, the second forces exit 1.
fn wait_for_shutdown(pool: &Arc<Pool>) -> ExitCode {
    let signal_count = Arc::new(AtomicUsize::new(0));
    let cancel = pool.cancel_token().clone();

    {
        let signal_count = signal_count.clone();
        ctrlc::set_handler(move || {
            let prior = signal_count.fetch_add(1, Ordering::SeqCst);
            if prior == 0 {
                log::info!("received termination signal, shutting down gracefully");
                cancel.cancel();
            } else {
                log::warn!("received second termination signal, exiting immediately");
                std::process::exit(1);
            }
        })
        .expect("failed to register termination signal handler");
    }

    pool.shutdown();
    ExitCode::SUCCESS
}

fn watch_config(
    path: Utf8PathBuf,
    pool: Arc<Pool>,
    reconciler: Reconciler,
    metrics: Arc<dyn MetricsSink>,
) {
    use notify::{RecursiveMode, Watcher};

    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = match notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    }) {
        Ok(w) => w,
        Err(e) => {
            log::error!("could not start config watcher: {e}");
            return;
        }
    };
    if let Err(e) = watcher.watch(path.as_std_path(), RecursiveMode::NonRecursive) {
        log::error!("could not watch {path}: {e}");
        return;
    }

    std::thread::Builder::new()
        .name("config-watch".into())
        .spawn(move || {
            // keep the watcher alive for the thread's lifetime
            let _watcher = watcher;
            for event in rx {
                if event.is_err() {
                    continue;
                }
                std::thread::sleep(Duration::from_millis(100));
                reload_once(&path, &pool, &reconciler, &metrics);
            }
        })
        .expect("failed to spawn config-watch thread");
}

fn reload_once(path: &Utf8PathBuf, pool: &Arc<Pool>, reconciler: &Reconciler, metrics: &Arc<dyn MetricsSink>) {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            log::warn!("config reload: could not read {path}: {e}");
            metrics.set_last_reload_success(path.as_str(), false, unix_now());
            return;
        }
    };
    let result = reconciler
        .prepare(&text)
        .and_then(|cfg| reconciler.reconcile(pool, &cfg));
    match &result {
        Ok(()) => log::info!("config reload applied"),
        Err(e) => log::warn!("config reload failed, live state untouched: {e}"),
    }
    metrics.set_last_reload_success(path.as_str(), result.is_ok(), unix_now());

    if result.is_ok() {
        pool.start_loop();
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
