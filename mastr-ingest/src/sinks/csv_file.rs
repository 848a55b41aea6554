use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use futures::StreamExt;
use mastr_client::domain::{Row, Table, TableSchema};

use crate::{
    pipeline::{Envelope, PipelineError, Sink, SinkSummary},
    sources::csv_file::read_keys,
};

/// Rows between explicit flushes, so an interrupted run keeps most of its work.
const FLUSH_EVERY: usize = 1000;

fn sink_err(path: &Path, what: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Sink(format!("{what} {}: {e}", path.display()))
}

fn ensure_parent(path: &Path) -> Result<(), PipelineError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            fs::create_dir_all(dir).map_err(|e| sink_err(dir, "failed to create directory", e))
        }
        _ => Ok(()),
    }
}

/// Length of `file` up to and including its last newline; 0 if it has none.
fn complete_len(file: &mut File, len: u64) -> io::Result<u64> {
    let mut buf = [0u8; 4096];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(i) = chunk.iter().rposition(|b| *b == b'\n') {
            return Ok(start + i as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// Drop an unterminated last line left behind by an interrupted append.
/// Its row is downloaded again, since its key no longer appears in the file.
fn truncate_partial_tail(path: &Path) -> Result<(), PipelineError> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(sink_err(path, "failed to open", e)),
    };
    let len = file
        .metadata()
        .map_err(|e| sink_err(path, "failed to inspect", e))?
        .len();
    let keep = complete_len(&mut file, len).map_err(|e| sink_err(path, "failed to read", e))?;

    if keep < len {
        tracing::warn!(path = %path.display(), dropped_bytes = len - keep, "truncating incomplete last line");
        file.set_len(keep).map_err(|e| sink_err(path, "failed to truncate", e))?;
    }
    Ok(())
}

/// Header of an existing file, or `None` when the file is missing or empty.
fn existing_header(path: &Path) -> Result<Option<Vec<String>>, PipelineError> {
    if fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true) {
        return Ok(None);
    }
    let mut rdr = csv::Reader::from_path(path).map_err(|e| sink_err(path, "failed to open", e))?;
    let headers = rdr.headers().map_err(|e| sink_err(path, "failed to read header of", e))?;
    Ok(Some(headers.iter().map(str::to_string).collect()))
}

/// Appends rows to a per-table CSV file, skipping keys the file already holds.
///
/// The first row seen for a key is kept; later duplicates are counted and
/// dropped. A file written with another column layout is refused.
pub struct CsvSink {
    path: PathBuf,
    schema: TableSchema,
}

impl CsvSink {
    pub fn new<P: Into<PathBuf>>(path: P, schema: TableSchema) -> Self {
        Self {
            path: path.into(),
            schema,
        }
    }
}

#[async_trait::async_trait]
impl Sink<Row> for CsvSink {
    async fn run<S>(&self, mut input: S) -> Result<SinkSummary, PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<Row>, PipelineError>> + Send + Unpin + 'static,
    {
        ensure_parent(&self.path)?;
        truncate_partial_tail(&self.path)?;

        let header = existing_header(&self.path)?;
        if let Some(h) = &header {
            if *h != self.schema.columns {
                return Err(PipelineError::Sink(format!(
                    "{} has a different column layout than table '{}'",
                    self.path.display(),
                    self.schema.name
                )));
            }
        }

        let mut seen: HashSet<String> = read_keys(&self.path, &self.schema)?.into_iter().collect();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| sink_err(&self.path, "failed to open", e))?;
        let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(file);

        if header.is_none() {
            wtr.write_record(&self.schema.columns)
                .map_err(|e| sink_err(&self.path, "failed to write header to", e))?;
        }

        let key_idx = self.schema.key_index();
        let width = self.schema.columns.len();
        let mut summary = SinkSummary::default();

        while let Some(item) = input.next().await {
            let row = match item {
                Ok(env) => env.payload,
                Err(e) => {
                    tracing::warn!(error = %e, table = %self.schema.name, "skipping record");
                    summary.skipped += 1;
                    continue;
                }
            };

            let key = row.get(key_idx).map(String::as_str).unwrap_or("");
            if row.len() != width || key.is_empty() {
                tracing::warn!(table = %self.schema.name, values = row.len(), "skipping malformed row");
                summary.skipped += 1;
                continue;
            }
            if seen.contains(key) {
                summary.duplicates += 1;
                continue;
            }

            wtr.write_record(&row)
                .map_err(|e| sink_err(&self.path, "failed to write to", e))?;
            seen.insert(key.to_string());
            summary.written += 1;

            if summary.written % FLUSH_EVERY == 0 {
                wtr.flush().map_err(|e| sink_err(&self.path, "failed to flush", e))?;
            }
        }

        wtr.flush().map_err(|e| sink_err(&self.path, "failed to flush", e))?;

        metrics::counter!("csv_rows_written_total", "table" => self.schema.name.clone())
            .increment(summary.written as u64);
        metrics::counter!("csv_rows_duplicate_total", "table" => self.schema.name.clone())
            .increment(summary.duplicates as u64);
        tracing::info!(
            path = %self.path.display(),
            written = summary.written,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            "CSV append finished"
        );

        Ok(summary)
    }
}

/// Write `table` to `path`, replacing any previous file.
pub fn write_table(path: &Path, table: &Table) -> Result<(), PipelineError> {
    ensure_parent(path)?;
    let mut wtr = csv::Writer::from_path(path).map_err(|e| sink_err(path, "failed to create", e))?;

    wtr.write_record(&table.columns)
        .map_err(|e| sink_err(path, "failed to write header to", e))?;
    for row in &table.rows {
        wtr.write_record(row).map_err(|e| sink_err(path, "failed to write to", e))?;
    }
    wtr.flush().map_err(|e| sink_err(path, "failed to flush", e))?;

    tracing::info!(path = %path.display(), rows = table.len(), "CSV written");
    Ok(())
}
