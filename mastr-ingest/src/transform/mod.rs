use std::borrow::Cow;

use mastr_client::domain::{Row, TableSchema};

use crate::{
    fixtures::ENCODING_FIXES,
    pipeline::{Envelope, PipelineError, Transform},
    sources::RawRecord,
};

/// Repair text that was UTF-8 but got decoded as Latin-1 somewhere upstream.
pub fn fix_encoding(value: &str) -> Cow<'_, str> {
    // Every known artifact starts with one of these.
    if !value.contains(|c: char| matches!(c, 'Ã' | 'â' | 'Â')) {
        return Cow::Borrowed(value);
    }
    let mut out = value.to_string();
    for (broken, fixed) in ENCODING_FIXES {
        if out.contains(*broken) {
            out = out.replace(*broken, fixed);
        }
    }
    Cow::Owned(out)
}

/// Map a raw record onto `schema`'s columns.
///
/// Missing fields become empty strings and values are trimmed and repaired.
/// Fields the schema does not know are returned separately for logging.
pub fn normalize<'a>(record: &'a RawRecord, schema: &TableSchema) -> (Row, Vec<&'a str>) {
    let row = schema
        .columns
        .iter()
        .map(|c| {
            record
                .get(c)
                .map(|v| fix_encoding(v.trim()).into_owned())
                .unwrap_or_default()
        })
        .collect();

    let unknown = record
        .keys()
        .filter(|k| schema.column_index(k).is_none())
        .map(String::as_str)
        .collect();

    (row, unknown)
}

/// Raw registry record to schema row.
#[derive(Clone)]
pub struct Normalizer {
    schema: TableSchema,
}

impl Normalizer {
    pub fn new(schema: TableSchema) -> Self {
        Self { schema }
    }
}

#[async_trait::async_trait]
impl Transform<RawRecord, Row> for Normalizer {
    async fn apply(&self, input: Envelope<RawRecord>) -> Result<Envelope<Row>, PipelineError> {
        let (row, unknown) = normalize(&input.payload, &self.schema);
        if !unknown.is_empty() {
            metrics::counter!("normalizer_unknown_fields_total").increment(unknown.len() as u64);
            tracing::debug!(table = %self.schema.name, fields = ?unknown, "ignoring unknown fields");
        }
        metrics::counter!("normalizer_records_total").increment(1);

        Ok(Envelope {
            payload: row,
            received_at: input.received_at,
        })
    }
}

/// Reject rows with an empty required column.
pub fn validate_required(env: Envelope<Row>, schema: &TableSchema) -> Result<Envelope<Row>, PipelineError> {
    if env.payload.len() != schema.columns.len() {
        return Err(PipelineError::Transform(format!(
            "{}: row has {} values, expected {}",
            schema.name,
            env.payload.len(),
            schema.columns.len()
        )));
    }

    for column in schema.required_columns() {
        let empty = schema
            .column_index(column)
            .and_then(|i| env.payload.get(i))
            .map_or(true, |v| v.trim().is_empty());
        if empty {
            return Err(PipelineError::Transform(format!(
                "{}: required field '{column}' is empty",
                schema.name
            )));
        }
    }

    Ok(env)
}

#[derive(Clone)]
pub struct RequiredFields {
    schema: TableSchema,
}

impl RequiredFields {
    pub fn new(schema: TableSchema) -> Self {
        Self { schema }
    }
}

#[async_trait::async_trait]
impl Transform<Row, Row> for RequiredFields {
    async fn apply(&self, input: Envelope<Row>) -> Result<Envelope<Row>, PipelineError> {
        match validate_required(input, &self.schema) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_rows_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TableSchema {
        let mut s = TableSchema::new("unit_biomass", "EinheitMastrNummer", ["EinheitMastrNummer", "Ort", "Hauptbrennstoff"]);
        s.required = vec!["Ort".to_string()];
        s
    }

    fn record(pairs: &[(&str, &str)]) -> RawRecord {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn repairs_known_mis_decodings() {
        assert_eq!(fix_encoding("MÃ¼nchen"), "München");
        assert_eq!(fix_encoding("StraÃŸe â€“ Nord"), "Straße – Nord");
        assert_eq!(fix_encoding("GÃ–RLITZ"), "GÖRLITZ");
        assert!(matches!(fix_encoding("Köln"), Cow::Borrowed("Köln")));
    }

    #[test]
    fn normalizes_onto_schema_columns() {
        let rec = record(&[
            ("EinheitMastrNummer", " SEE1 "),
            ("Ort", "NÃ¼rnberg"),
            ("Registrierungsdatum", "2019-01-01"),
        ]);
        let (row, unknown) = normalize(&rec, &schema());
        assert_eq!(row, vec!["SEE1", "Nürnberg", ""]);
        assert_eq!(unknown, vec!["Registrierungsdatum"]);
    }

    #[test]
    fn rejects_rows_missing_required_fields() {
        let ok = Envelope::new(vec!["SEE1".to_string(), "Ulm".to_string(), "".to_string()]);
        assert!(validate_required(ok, &schema()).is_ok());

        let no_key = Envelope::new(vec!["".to_string(), "Ulm".to_string(), "Holz".to_string()]);
        assert!(matches!(validate_required(no_key, &schema()), Err(PipelineError::Transform(_))));

        let no_town = Envelope::new(vec!["SEE2".to_string(), " ".to_string(), "Holz".to_string()]);
        assert!(matches!(validate_required(no_town, &schema()), Err(PipelineError::Transform(_))));

        let short = Envelope::new(vec!["SEE3".to_string()]);
        assert!(matches!(validate_required(short, &schema()), Err(PipelineError::Transform(_))));
    }

    #[tokio::test]
    async fn normalizer_keeps_receive_time() {
        let env = Envelope::new(record(&[("EinheitMastrNummer", "SEE1")]));
        let received = env.received_at;
        let out = Normalizer::new(schema()).apply(env).await.expect("normalize");
        assert_eq!(out.received_at, received);
        assert_eq!(out.payload, vec!["SEE1", "", ""]);
    }
}
