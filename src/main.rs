//! `stageflow` command line: run the coffee-shop queries over a directory of
//! CSV datasets on the in-process broker.
//!
//! ```text
//! stageflow --data-dir ./data --output-dir ./out --sessions 2
//! ```
//!
//! Each session uploads the same datasets under its own id; results land in
//! `<output-dir>/<session>/<query>.csv`. `RUST_LOG` controls verbosity.

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use rayon::prelude::*;
use stageflow::config::PipelineConfig;
use stageflow::io::csv::{RowBatches, dataset_files, write_results};
use stageflow::message::Kind;
use stageflow::queries::coffee_shop;
use stageflow::{
    CancellationToken, MemoryBroker, MetricsRegistry, ResultCollector, Runner, SessionGateway,
    Transport,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stageflow", version, about = "Run the coffee-shop queries over CSV datasets")]
struct Args {
    /// Directory holding `<dataset>.csv` files or `<dataset>/` directories of parts.
    #[arg(long, env = "STAGEFLOW_DATA_DIR")]
    data_dir: PathBuf,

    /// JSON configuration file; `STAGEFLOW_*` variables override it.
    #[arg(long, env = "STAGEFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Where result CSVs are written, one subdirectory per session.
    #[arg(long, default_value = "results")]
    output_dir: PathBuf,

    /// Concurrent client sessions uploading the same datasets.
    #[arg(long, default_value_t = 1)]
    sessions: usize,

    /// Seconds to wait for one session's results.
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Also write the stage counters as JSON.
    #[arg(long)]
    metrics_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let args = Args::parse();
    if args.sessions == 0 {
        bail!("--sessions must be at least 1");
    }
    let cfg = PipelineConfig::load(args.config.as_deref())?;
    let topology = coffee_shop(&cfg);

    let cancel = CancellationToken::new();
    watch_signals(cancel.clone())?;

    let transport: Arc<dyn Transport> = Arc::new(MemoryBroker::new());
    let metrics = MetricsRegistry::new();

    let pipeline = Runner::new(Arc::clone(&transport), metrics.clone()).spawn(&topology, &cancel)?;
    info!(instances = pipeline.instances(), "pipeline started");

    let gateway = SessionGateway::new(
        Arc::clone(&transport),
        topology.gateway_routes()?,
        topology.max_batch_size(),
        metrics.register("gateway-0"),
    )?;
    let collector = Arc::new(ResultCollector::new(
        transport,
        topology.results_source(),
        topology.expected_results(),
    )?);
    let collector_thread = {
        let collector = Arc::clone(&collector);
        let cancel = cancel.clone();
        thread::Builder::new()
            .name("results".into())
            .spawn(move || collector.run(&cancel))
            .context("start result collector")?
    };

    let timeout = Duration::from_secs(args.timeout);
    let outcome = (0..args.sessions).into_par_iter().try_for_each(|_| {
        let session = gateway.open_session();
        upload_dir(&gateway, &session, &args.data_dir, topology.max_batch_size())?;
        let results = collector
            .wait_for(&session, timeout)?
            .ok_or_else(|| anyhow!("session {session} produced no results within {timeout:?}"))?;
        gateway.close_session(&session);
        let written = write_results(&args.output_dir, &results)?;
        info!(session = %session, rows = written, "results written");
        Ok::<_, anyhow::Error>(())
    });

    cancel.cancel();
    metrics.record_end();
    let stages = pipeline.join();
    let collected = collector_thread
        .join()
        .map_err(|_| anyhow!("result collector panicked"))?;

    metrics.print();
    if let Some(path) = &args.metrics_file {
        metrics.save_to_file(path)?;
    }
    outcome?;
    stages?;
    collected?;
    Ok(())
}

/// Stream every dataset of `dir` through the gateway under `session`.
fn upload_dir(gateway: &SessionGateway, session: &str, dir: &Path, batch: usize) -> Result<()> {
    for kind in Kind::DATASETS {
        let files = dataset_files(dir, kind)?;
        if files.is_empty() {
            warn!(%kind, dir = %dir.display(), "no files for dataset; sending EOF only");
        }
        for file in files {
            for rows in RowBatches::open(&file, batch)? {
                gateway.upload(session, kind, rows?)?;
            }
        }
        gateway.finish(session, kind)?;
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C or SIGTERM. The signal wait lives on its own
/// single-threaded runtime and ends when `token` is cancelled elsewhere; the
/// pipeline itself is plain threads.
fn watch_signals(token: CancellationToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            runtime.block_on(async {
                tokio::select! {
                    () = wait_for_shutdown() => {
                        warn!("shutdown requested");
                        token.cancel();
                    }
                    () = token.cancelled() => {}
                }
            });
        })
        .context("start signal watcher")?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
