use std::time::Duration;

use futures::StreamExt;
use mastr_client::{
    db::Database,
    domain::{Row, TableSchema},
};

use crate::{
    config::SinkConfig,
    pipeline::{Envelope, PipelineError, Sink, SinkSummary},
};

/// Upserts rows into the schema's table in batches.
pub struct DbSink {
    db: Database,
    schema: TableSchema,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl DbSink {
    pub fn new(db: Database, schema: TableSchema, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            db,
            schema,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
        }
    }

    pub fn from_config(db: Database, schema: TableSchema, cfg: &SinkConfig) -> Self {
        Self::new(
            db,
            schema,
            cfg.batch_size,
            cfg.max_retries,
            Duration::from_millis(cfg.retry_backoff_ms),
        )
    }

    /// Upsert `rows`, retrying connection-level failures with backoff.
    async fn upsert_with_retry(&self, rows: &[Row]) -> Result<(), Failure> {
        let mut attempt: u32 = 0;
        loop {
            match self.db.upsert_rows(&self.schema, rows).await {
                Ok(_) => return Ok(()),
                Err(e @ sqlx::Error::Database(_)) => return Err(Failure::Rejected(e)),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        table = %self.schema.name,
                        "database upsert failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, table = %self.schema.name, "database upsert failed, giving up");
                    metrics::counter!("db_sink_errors_total").increment(1);
                    return Err(Failure::Fatal(PipelineError::Sink(e.to_string())));
                }
            }
        }
    }

    /// Upsert a batch and return how many of its rows the database rejected.
    ///
    /// A batch the database refuses as a whole is replayed row by row, so one
    /// bad row only costs itself.
    async fn flush_batch(&self, batch: &[Row]) -> Result<usize, PipelineError> {
        if batch.is_empty() {
            return Ok(0);
        }

        match self.upsert_with_retry(batch).await {
            Ok(()) => {
                metrics::counter!("db_upserted_rows_total", "table" => self.schema.name.clone())
                    .increment(batch.len() as u64);
                return Ok(0);
            }
            Err(Failure::Fatal(e)) => return Err(e),
            Err(Failure::Rejected(e)) => {
                tracing::warn!(
                    error = %e,
                    table = %self.schema.name,
                    rows = batch.len(),
                    "batch rejected, upserting rows one by one"
                );
            }
        }

        let key_idx = self.schema.key_index();
        let mut rejected = 0usize;
        for row in batch {
            match self.upsert_with_retry(std::slice::from_ref(row)).await {
                Ok(()) => {
                    metrics::counter!("db_upserted_rows_total", "table" => self.schema.name.clone()).increment(1);
                }
                Err(Failure::Fatal(e)) => return Err(e),
                Err(Failure::Rejected(e)) => {
                    rejected += 1;
                    metrics::counter!("db_rows_rejected_total", "table" => self.schema.name.clone()).increment(1);
                    tracing::warn!(
                        error = %e,
                        table = %self.schema.name,
                        key = row.get(key_idx).map(String::as_str).unwrap_or(""),
                        "row rejected by database, skipping"
                    );
                }
            }
        }
        Ok(rejected)
    }
}

enum Failure {
    /// The database refused the statement; retrying the same rows cannot help.
    Rejected(sqlx::Error),
    Fatal(PipelineError),
}

#[async_trait::async_trait]
impl Sink<Row> for DbSink {
    async fn run<S>(&self, mut input: S) -> Result<SinkSummary, PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<Row>, PipelineError>> + Send + Unpin + 'static,
    {
        self.db
            .ensure_table(&self.schema)
            .await
            .map_err(|e| PipelineError::Sink(format!("failed to create table '{}': {e}", self.schema.name)))?;

        let key_idx = self.schema.key_index();
        let width = self.schema.columns.len();
        let mut summary = SinkSummary::default();
        let mut buffer: Vec<Row> = Vec::with_capacity(self.batch_size);

        while let Some(item) = input.next().await {
            let row = match item {
                Ok(env) => env.payload,
                Err(e) => {
                    tracing::warn!(error = %e, table = %self.schema.name, "skipping record");
                    summary.skipped += 1;
                    continue;
                }
            };

            if row.len() != width || row.get(key_idx).map_or(true, |k| k.is_empty()) {
                tracing::warn!(table = %self.schema.name, values = row.len(), "skipping malformed row");
                summary.skipped += 1;
                continue;
            }

            buffer.push(row);
            if buffer.len() >= self.batch_size {
                let rejected = self.flush_batch(&buffer).await?;
                summary.written += buffer.len() - rejected;
                summary.skipped += rejected;
                buffer.clear();
            }
        }

        if !buffer.is_empty() {
            let rejected = self.flush_batch(&buffer).await?;
            summary.written += buffer.len() - rejected;
            summary.skipped += rejected;
        }

        tracing::info!(
            table = %self.schema.name,
            written = summary.written,
            skipped = summary.skipped,
            "database load finished"
        );
        Ok(summary)
    }
}
