use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use job_tracker::config::TrackerConfig;
use job_tracker::error::{ConfigError, PipelineError};
use job_tracker::llm::{LlmConfig, create_provider};
use job_tracker::mail::{ImapConfig, ImapMailSource, MailSource};
use job_tracker::pipeline::{CycleRunner, LlmExtractor};
use job_tracker::store::{LibSqlStateStore, StateStore};
use job_tracker::sync::{GoogleSheetsStore, MemorySheetStore, SheetsConfig, SpreadsheetStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();

    let config = TrackerConfig::from_env().context("Invalid tracker configuration")?;
    let llm_config = LlmConfig::from_env().context("Invalid LLM configuration")?;
    let llm = create_provider(&llm_config)?;
    let capability = Arc::new(LlmExtractor::new(llm));

    let sheet: Arc<dyn SpreadsheetStore> = match SheetsConfig::from_env() {
        Ok(sheets) => {
            info!(spreadsheet = %sheets.spreadsheet_id, sheet = %sheets.sheet_name, "Mirroring to Google Sheets");
            Arc::new(GoogleSheetsStore::new(sheets))
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            warn!(missing = %var, "Google Sheets not configured, mirroring to an in-memory sheet");
            Arc::new(MemorySheetStore::new())
        }
        Err(e) => return Err(e.into()),
    };

    let source = ImapMailSource::new(ImapConfig::from_env().context("Invalid IMAP configuration")?);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("JOB_TRACKER_DB_PATH").unwrap_or_else(|_| "./data/job-tracker.db".to_string());
    let store = LibSqlStateStore::new_local(Path::new(&db_path))
        .await
        .with_context(|| format!("Failed to open database at {db_path}"))?;

    let mut runner = CycleRunner::new(config.clone(), capability, sheet);
    let mut registry = runner.restore(store.load().await?);
    info!(
        db = %db_path,
        applications = registry.len(),
        carried_over = runner.carried_over().len(),
        poll_interval_secs = config.poll_interval.as_secs(),
        "Job tracker started"
    );

    // Ctrl-C cancels the running cycle at its next stage boundary.
    let cancel = runner.cancel_handle();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            cancel.store(true, Ordering::SeqCst);
            let _ = shutdown_tx.send(true);
        }
    });

    let run_once = std::env::var("JOB_TRACKER_ONCE")
        .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => break,
        }

        let batch = match source.fetch_batch().await {
            Ok(batch) => batch,
            Err(e) => {
                error!(source = source.name(), error = %e, "Mail fetch failed, skipping cycle");
                if run_once {
                    break;
                }
                continue;
            }
        };
        let ids: Vec<String> = batch.iter().map(|m| m.provider_message_id.clone()).collect();

        let cancelled = match runner.run_cycle(&mut registry, &batch).await {
            Ok(_) => false,
            Err(PipelineError::Cancelled { stage }) => {
                info!(stage, "Cycle cancelled, saving state");
                true
            }
            Err(e) => {
                error!(error = %e, "Cycle failed");
                false
            }
        };

        // Unacknowledged messages are fetched again and reprocessed idempotently.
        match store.save(&runner.export(&registry)).await {
            Ok(()) if !cancelled => {
                if let Err(e) = source.acknowledge(&ids).await {
                    warn!(error = %e, "Failed to acknowledge processed messages");
                }
            }
            Ok(()) => {}
            Err(e) => error!(error = %e, "Failed to save engine state"),
        }

        if cancelled || run_once {
            break;
        }
    }

    info!(applications = registry.len(), "Job tracker stopped");
    Ok(())
}

/// Stderr logging, plus a daily-rolling file under `JOB_TRACKER_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("JOB_TRACKER_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "job-tracker.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    guard
}
