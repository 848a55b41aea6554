use std::{fs::File, io, path::{Path, PathBuf}};

use csv::StringRecord;
use mastr_client::domain::{Row, Table, TableSchema};

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// Position of each schema column in the file's header, if present.
fn column_positions(schema: &TableSchema, headers: &StringRecord) -> Vec<Option<usize>> {
    schema
        .columns
        .iter()
        .map(|c| headers.iter().position(|h| h == c))
        .collect()
}

fn project(record: &StringRecord, positions: &[Option<usize>]) -> Row {
    positions
        .iter()
        .map(|p| p.and_then(|i| record.get(i)).unwrap_or("").to_string())
        .collect()
}

fn open(path: &Path) -> Result<Option<csv::Reader<File>>, PipelineError> {
    match File::open(path) {
        Ok(file) => Ok(Some(csv::ReaderBuilder::new().flexible(true).from_reader(file))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PipelineError::Source(format!(
            "failed to open CSV file {}: {e}",
            path.display()
        ))),
    }
}

/// Read a whole CSV file into memory, mapping columns by header name onto
/// `schema`. Columns the file lacks are empty. A missing file is an empty
/// table.
pub fn read_table(path: &Path, schema: &TableSchema) -> Result<Table, PipelineError> {
    let mut table = Table::empty(schema);
    let Some(mut rdr) = open(path)? else {
        tracing::debug!(path = %path.display(), "CSV file missing, using empty table");
        return Ok(table);
    };

    let headers = rdr
        .headers()
        .map_err(|e| PipelineError::Source(format!("failed to read CSV headers: {e}")))?
        .clone();
    let positions = column_positions(schema, &headers);

    for result in rdr.records() {
        let record = result.map_err(|e| PipelineError::Source(format!("failed to read CSV record: {e}")))?;
        table.rows.push(project(&record, &positions));
    }

    Ok(table)
}

/// Keys already stored in a CSV file, in file order.
pub fn read_keys(path: &Path, schema: &TableSchema) -> Result<Vec<String>, PipelineError> {
    let key_only = TableSchema::new(&schema.name, &schema.key, [schema.key.clone()]);
    Ok(read_table(path, &key_only)?
        .rows
        .into_iter()
        .filter_map(|mut r| r.pop())
        .filter(|k| !k.is_empty())
        .collect())
}

/// Streams the rows of a CSV file in `schema` order for loading elsewhere.
///
/// A record whose field count differs from the header is yielded as an error
/// and the stream carries on.
pub struct CsvFileSource {
    path: PathBuf,
    schema: TableSchema,
}

impl CsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P, schema: TableSchema) -> Self {
        Self {
            path: path.into(),
            schema,
        }
    }
}

#[async_trait::async_trait]
impl Source<Row> for CsvFileSource {
    async fn stream(&self) -> EnvelopeStream<Row> {
        // Blocking reads inside the stream are fine for a sequential job.
        let path = self.path.clone();
        let schema = self.schema.clone();

        let s = async_stream::stream! {
            let mut rdr = match open(&path) {
                Ok(Some(rdr)) => rdr,
                Ok(None) => {
                    tracing::warn!(path = %path.display(), "CSV file missing, nothing to load");
                    return;
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let headers = match rdr.headers() {
                Ok(h) => h.clone(),
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to read CSV headers: {e}")));
                    return;
                }
            };
            let positions = column_positions(&schema, &headers);

            for (line, result) in rdr.records().enumerate() {
                match result {
                    Ok(record) if record.len() == headers.len() => {
                        yield Ok(Envelope::new(project(&record, &positions)));
                    }
                    Ok(record) => {
                        metrics::counter!("csv_malformed_rows_total").increment(1);
                        yield Err(PipelineError::Source(format!(
                            "{}: record {} has {} fields, expected {}",
                            path.display(),
                            line + 1,
                            record.len(),
                            headers.len()
                        )));
                    }
                    Err(e) => {
                        metrics::counter!("csv_malformed_rows_total").increment(1);
                        yield Err(PipelineError::Source(format!("failed to read CSV record: {e}")));
                    }
                }
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;

    fn schema() -> TableSchema {
        TableSchema::new("unit_biomass", "EinheitMastrNummer", ["EinheitMastrNummer", "Hauptbrennstoff", "Biomasseart"])
    }

    fn write(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("in.csv");
        let mut f = File::create(&path).expect("create");
        f.write_all(contents.as_bytes()).expect("write");
        path
    }

    #[test]
    fn missing_file_reads_as_empty_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = read_table(&dir.path().join("nope.csv"), &schema()).expect("read");
        assert!(table.is_empty());
        assert_eq!(table.columns, schema().columns);
    }

    #[test]
    fn maps_columns_by_header_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(&dir, "Hauptbrennstoff,Extra,EinheitMastrNummer\nBiogas,x,SEE1\nHolz,y,SEE2\n");

        let table = read_table(&path, &schema()).expect("read");
        assert_eq!(table.rows[0], vec!["SEE1", "Biogas", ""]);
        assert_eq!(table.rows[1], vec!["SEE2", "Holz", ""]);
        assert_eq!(read_keys(&path, &schema()).expect("keys"), vec!["SEE1", "SEE2"]);
    }

    #[tokio::test]
    async fn source_skips_records_with_wrong_width() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(
            &dir,
            "EinheitMastrNummer,Hauptbrennstoff,Biomasseart\nSEE1,Biogas,fest\nSEE2,Holz\nSEE3,Gas,fluessig\n",
        );

        let items: Vec<_> = CsvFileSource::new(&path, schema()).stream().await.collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[1].is_err());
        let keys: Vec<&str> = items
            .iter()
            .filter_map(|i| i.as_ref().ok())
            .map(|e| e.payload[0].as_str())
            .collect();
        assert_eq!(keys, vec!["SEE1", "SEE3"]);
    }

    #[tokio::test]
    async fn source_over_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let items: Vec<_> = CsvFileSource::new(dir.path().join("nope.csv"), schema())
            .stream()
            .await
            .collect()
            .await;
        assert!(items.is_empty());
    }
}
