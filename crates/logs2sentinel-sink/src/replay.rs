//! Replay of persisted failed batches
//!
//! Iterates the failed-batch store, re-routes each payload through the sink,
//! and archives files whose batches were fully delivered. Files that fail
//! again stay in place for the next replay run.

use crate::failed_batch::FailedBatchStore;
use crate::route::SentinelSink;

#[derive(Debug, Clone)]
pub struct ReplayError {
    pub file: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReplaySummary {
    /// Files examined.
    pub processed: usize,
    /// Files that could not be replayed (and were left in place).
    pub failed: usize,
    /// Files archived after successful replay.
    pub archived: usize,
    pub errors: Vec<ReplayError>,
}

/// Replay every persisted failed batch through `sink` as `log_type`.
pub async fn replay_failed_batches(sink: &SentinelSink, log_type: &str) -> ReplaySummary {
    let store: &FailedBatchStore = sink.failed_store();
    let mut summary = ReplaySummary::default();

    let files = match store.list_files().await {
        Ok(files) => files,
        Err(e) => {
            tracing::error!(error = %e, "failed to list failed-batch store");
            summary.failed = 1;
            summary.errors.push(ReplayError {
                file: String::new(),
                error: e.to_string(),
            });
            return summary;
        }
    };

    for file in files {
        summary.processed += 1;
        match replay_one(sink, store, log_type, &file).await {
            Ok(()) => summary.archived += 1,
            Err(error) => {
                tracing::warn!(file = %file, error = %error, "replay failed");
                summary.failed += 1;
                summary.errors.push(ReplayError { file, error });
            }
        }
    }

    tracing::info!(
        processed = summary.processed,
        archived = summary.archived,
        failed = summary.failed,
        "replay pass complete"
    );
    summary
}

async fn replay_one(
    sink: &SentinelSink,
    store: &FailedBatchStore,
    log_type: &str,
    file: &str,
) -> Result<(), String> {
    let document = store.read(file).await.map_err(|e| e.to_string())?;

    let report = sink
        .route(log_type, document.data)
        .await
        .map_err(|e| e.to_string())?;
    if report.failed > 0 {
        return Err(format!(
            "{} of {} records failed again",
            report.failed,
            report.records_in()
        ));
    }

    store.archive(file).await.map_err(|e| e.to_string())?;
    Ok(())
}
