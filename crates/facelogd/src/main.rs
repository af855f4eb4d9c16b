use anyhow::{Context, Result};
use facelog_core::{Coordinator, MetricsRecorder, Reconciler, Worker};
use facelog_store::{RedisFlagStore, RedisQueue, RedisVectorIndex, SqliteStore};
use facelog_vision::FacePipeline;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facelogd starting");

    let recorder = MetricsRecorder::new();
    if recorder.install().is_err() {
        tracing::warn!("metrics recorder already installed; periodic metrics will read empty");
    }
    facelog_core::register_metrics();

    let config = config::Config::from_env();
    tracing::info!(
        worker_id = %config.worker_id,
        queue = %config.queue,
        index = %config.index,
        db = %config.db_path.display(),
        accept = config.reconciler.thresholds.accept,
        margin = config.reconciler.thresholds.margin,
        "configuration loaded"
    );

    let pipeline = FacePipeline::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    let engine = engine::spawn_engine(engine::pipeline_backend(pipeline))?;

    // The queue blocks its connection in BLMOVE; flags and the index share the other one.
    let conn = facelog_store::connect(&config.redis_url)
        .await
        .with_context(|| format!("connecting to {}", config.redis_url))?;
    let queue_conn = facelog_store::connect(&config.redis_url)
        .await
        .context("opening queue connection")?;

    let index = RedisVectorIndex::new(conn.clone(), config.index.clone());
    index.ensure_index().await.context("preparing vector index")?;

    let db = SqliteStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?;

    let queue = RedisQueue::new(queue_conn, &config.queue, &config.worker_id);
    queue.recover().await.context("recovering processing list")?;

    let coordinator = Arc::new(Coordinator::new(
        Arc::new(RedisFlagStore::new(conn)),
        config.reconciler.dedup_ttl,
        config.reconciler.camera_lock_ttl,
    ));
    let reconciler = Arc::new(Reconciler::new(
        coordinator,
        Arc::new(index),
        Arc::new(db),
        config.reconciler.clone(),
    ));
    let worker = Worker::new(Arc::new(queue), Arc::new(engine), reconciler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_task = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let reporter = {
        let recorder = recorder.clone();
        let period = config.metrics_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                log_metrics(&recorder, "metrics");
            }
        })
    };

    tracing::info!("facelogd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facelogd shutting down");

    let _ = shutdown_tx.send(true);
    let handled = worker_task.await.context("worker task panicked")?;
    reporter.abort();

    tracing::info!(handled, "worker stopped");
    log_metrics(&recorder, "final metrics");

    Ok(())
}

fn log_metrics(recorder: &MetricsRecorder, message: &str) {
    let s = recorder.snapshot();
    tracing::info!(
        match_attempts = s.match_attempts,
        match_successes = s.match_successes,
        guesses_created = s.guesses_created,
        sink_successes = s.sink_successes,
        sink_failures = s.sink_failures,
        suppressed = ?s.suppressed,
        dropped = ?s.dropped,
        match_duration_samples = s.match_duration_samples,
        match_duration_mean_ms = s.match_duration_mean_ms,
        match_duration_max_ms = s.match_duration_max_ms,
        "{}",
        message
    );
}
