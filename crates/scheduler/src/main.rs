//! llmq scheduler - Main Entry Point
//!
//! Loads the configuration, connects the inference backend and runs the
//! scheduler until interrupted.

use anyhow::Context;
use llmq_common::config::{BackendKind, ObservabilityConfig};
use llmq_common::{LlmqConfig, METRICS};
use llmq_scheduler::backend::ollama::OllamaBackend;
use llmq_scheduler::backend::scripted::ScriptedBackend;
use llmq_scheduler::{InferenceBackend, ResourceMonitor, Scheduler};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Footprint of the model installed in the scripted backend
const SCRIPTED_MODEL_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path =
        std::env::var("LLMQ_CONFIG").unwrap_or_else(|_| "configs/llmq.yaml".to_string());

    let config = if Path::new(&config_path).exists() {
        LlmqConfig::from_file(&config_path)
    } else {
        LlmqConfig::from_env()
    }
    .with_context(|| format!("loading configuration ({})", config_path))?;

    init_logging(&config.observability);

    info!(
        "Configuration loaded: backend={:?}, max_concurrent_streams={}, inactivity_timeout={}s",
        config.backend.kind,
        config.scheduler.max_concurrent_streams,
        config.stream.inactivity_timeout_secs
    );

    let (backend, monitor) = build_backend(&config)?;
    let scheduler = Scheduler::new(&config, backend, monitor).context("building scheduler")?;
    scheduler.start().await;

    let metrics_handle = config
        .observability
        .metrics_textfile
        .clone()
        .filter(|_| config.observability.enable_metrics)
        .map(|path| {
            let every = Duration::from_secs(config.observability.metrics_interval_secs.max(1));
            tokio::spawn(write_metrics(path, every))
        });

    info!("llmq scheduler running");

    // Wait for shutdown signal
    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    if let Some(handle) = metrics_handle {
        handle.abort();
    }
    scheduler.shutdown().await.context("shutting down scheduler")?;

    info!("llmq scheduler shutdown complete");
    Ok(())
}

fn init_logging(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("llmq_scheduler={0},llmq_common={0}", observability.log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if observability.structured_logging {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_backend(
    config: &LlmqConfig,
) -> anyhow::Result<(Arc<dyn InferenceBackend>, Arc<dyn ResourceMonitor>)> {
    match config.backend.kind {
        BackendKind::Ollama => {
            let backend = Arc::new(OllamaBackend::new(&config.backend)?);
            info!(base_url = %config.backend.base_url, "Using Ollama backend");
            let monitor: Arc<dyn ResourceMonitor> = backend.clone();
            let backend: Arc<dyn InferenceBackend> = backend;
            Ok((backend, monitor))
        }
        BackendKind::Scripted => {
            let model = config
                .models
                .preload
                .clone()
                .unwrap_or_else(|| "scripted".to_string());
            let backend = Arc::new(
                ScriptedBackend::new(config.backend.accelerator_memory_mb * 1024 * 1024)
                    .with_model(model.clone(), SCRIPTED_MODEL_BYTES),
            );
            warn!(model = %model, "Using scripted backend, no real inference is performed");
            let monitor: Arc<dyn ResourceMonitor> = backend.clone();
            let backend: Arc<dyn InferenceBackend> = backend;
            Ok((backend, monitor))
        }
    }
}

/// Periodically dump the metrics registry for a textfile collector
async fn write_metrics(path: PathBuf, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let tmp = path.with_extension("prom.tmp");
        let written = async {
            tokio::fs::write(&tmp, METRICS.gather()).await?;
            tokio::fs::rename(&tmp, &path).await
        };
        if let Err(e) = written.await {
            warn!(path = %path.display(), "Failed to write metrics: {}", e);
        }
    }
}
