//! End-to-end steps: download to CSV, load CSV into the database, join.
//!
//! Every step can be re-run. CSV appends skip keys already on disk, database
//! loads upsert, and the unified file is rewritten from its inputs.

use std::{
    cmp::{max, min},
    collections::HashSet,
    path::Path,
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use mastr_client::{
    db::Database,
    domain::{Extension, PowerUnit, Table, TableSchema, Technology},
};

use crate::{
    config::{AppConfig, SinkConfig},
    fixtures,
    join::{left_join, JoinSpec},
    pipeline::{Mapped, Pipeline, SinkSummary},
    sinks::{write_table, CsvSink, DbSink},
    sources::{read_keys, read_table, CsvFileSource, MastrSoapClient, PowerUnitListSource, UnitDetailSource},
    transform::{Normalizer, RequiredFields},
};

/// List all units of `tech` and append new ones to the power unit CSV.
pub async fn download_power_units(
    cfg: &AppConfig,
    client: Arc<MastrSoapClient>,
    tech: Technology,
) -> Result<SinkSummary> {
    let schema = cfg.power_unit_schema(tech);
    let path = cfg.csv_path(&schema.name);
    tracing::info!(%tech, path = %path.display(), "downloading power units");

    let pipeline = Pipeline {
        source: Mapped {
            inner: PowerUnitListSource::new(client, tech, &cfg.mastr),
            transform: Arc::new(Normalizer::new(schema.clone())),
        },
        transforms: vec![Arc::new(RequiredFields::new(schema.clone()))],
        sink: CsvSink::new(path, schema),
    };

    Ok(pipeline.run().await?)
}

/// Keys to look up for `ext`: referenced by the power units, not yet stored.
pub fn pending_extension_keys(cfg: &AppConfig, tech: Technology, ext: Extension) -> Result<Vec<String>> {
    let base_schema = cfg.power_unit_schema(tech);
    let ext_schema = cfg.extension_schema(tech, ext);

    let units = read_table(&cfg.csv_path(&base_schema.name), &base_schema)?;
    let mut skip: HashSet<String> = read_keys(&cfg.csv_path(&ext_schema.name), &ext_schema)?
        .into_iter()
        .collect();

    // insert() doubles as order-preserving dedup of the referenced keys
    Ok(units
        .column_values(ext.key_column())
        .into_iter()
        .filter(|k| skip.insert(k.clone()))
        .collect())
}

/// Fetch detail records of `ext` for every power unit that lacks one.
pub async fn download_extension(
    cfg: &AppConfig,
    client: Arc<MastrSoapClient>,
    tech: Technology,
    ext: Extension,
) -> Result<SinkSummary> {
    let schema = cfg.extension_schema(tech, ext);
    let path = cfg.csv_path(&schema.name);
    let keys = pending_extension_keys(cfg, tech, ext)?;
    tracing::info!(%tech, table = %schema.name, keys = keys.len(), "downloading unit details");

    if keys.is_empty() {
        return Ok(SinkSummary::default());
    }

    let pipeline = Pipeline {
        source: Mapped {
            inner: UnitDetailSource::new(client, tech, ext, keys),
            transform: Arc::new(Normalizer::new(schema.clone())),
        },
        transforms: vec![Arc::new(RequiredFields::new(schema.clone()))],
        sink: CsvSink::new(path, schema),
    };

    Ok(pipeline.run().await?)
}

/// Upsert the rows of a CSV file into the schema's table.
pub async fn load_table(db: &Database, schema: TableSchema, path: &Path, sink: &SinkConfig) -> Result<SinkSummary> {
    tracing::info!(table = %schema.name, path = %path.display(), "loading CSV into database");

    let pipeline = Pipeline {
        source: CsvFileSource::new(path, schema.clone()),
        transforms: vec![Arc::new(RequiredFields::new(schema.clone()))],
        sink: DbSink::from_config(db.clone(), schema, sink),
    };

    Ok(pipeline.run().await?)
}

fn join_specs<'a>(unit: &'a Table, eeg: &'a Table) -> [JoinSpec<'a>; 2] {
    [(unit, Extension::Unit), (eeg, Extension::Eeg)].map(|(table, ext)| JoinSpec {
        table,
        base_key: ext.key_column(),
        ext_key: ext.key_column(),
        suffix: ext.join_suffix(),
    })
}

fn unify(cfg: &AppConfig, tech: Technology, read: impl Fn(&TableSchema) -> Result<Table>) -> Result<Table> {
    let base = read(&cfg.power_unit_schema(tech))?;
    let unit = read(&cfg.extension_schema(tech, Extension::Unit))?;
    let eeg = read(&cfg.extension_schema(tech, Extension::Eeg))?;

    left_join(&base, &join_specs(&unit, &eeg)).map_err(|e| anyhow!("joining {tech} tables: {e}"))
}

/// Layout of the unified table of `tech`, without reading any file.
pub fn unified_schema(cfg: &AppConfig, tech: Technology) -> Result<TableSchema> {
    let table = unify(cfg, tech, |s| Ok(Table::empty(s)))?;
    Ok(table.schema(&fixtures::unified_table_name(tech)))
}

/// Join the power units of `tech` with both extension tables and rewrite the
/// unified CSV.
pub fn make_unified(cfg: &AppConfig, tech: Technology) -> Result<Table> {
    let table = unify(cfg, tech, |s| Ok(read_table(&cfg.csv_path(&s.name), s)?))?;

    let path = cfg.csv_path(&fixtures::unified_table_name(tech));
    write_table(&path, &table)?;

    let (with_capacity, capacity_kw) = total_capacity(&table);
    tracing::info!(
        %tech,
        path = %path.display(),
        rows = table.len(),
        with_capacity,
        capacity_mw = capacity_kw / 1000.0,
        commissioned = ?commissioning_span(&table),
        "joined unit tables"
    );

    Ok(table)
}

/// Units with a parseable net capacity, and their summed capacity in kW.
fn total_capacity(table: &Table) -> (usize, f64) {
    (0..table.len())
        .filter_map(|i| PowerUnit::from_table(table, i)?.net_capacity_kw())
        .fold((0, 0.0), |(n, sum), kw| (n + 1, sum + kw))
}

/// Earliest and latest commissioning date among the units.
fn commissioning_span(table: &Table) -> Option<(String, String)> {
    let (first, last) = (0..table.len())
        .filter_map(|i| PowerUnit::from_table(table, i)?.commissioned_on())
        .fold(None, |span, d| match span {
            None => Some((d, d)),
            Some((lo, hi)) => Some((min(lo, d), max(hi, d))),
        })?;
    Some((first.to_string(), last.to_string()))
}

/// Schema of table `name` for one of the configured technologies.
pub fn resolve_schema(cfg: &AppConfig, name: &str) -> Result<TableSchema> {
    for tech in &cfg.technologies {
        let mut candidates = vec![cfg.power_unit_schema(*tech)];
        candidates.extend(Extension::ALL.map(|ext| cfg.extension_schema(*tech, ext)));
        if let Some(s) = candidates.into_iter().find(|s| s.name == name) {
            return Ok(s);
        }
        if fixtures::unified_table_name(*tech) == name {
            return unified_schema(cfg, *tech);
        }
    }
    Err(anyhow!("unknown table '{name}' for the configured technologies"))
}

async fn load_all(cfg: &AppConfig, db: &Database, tech: Technology) -> Result<()> {
    let Some(db_cfg) = &cfg.database else {
        return Ok(());
    };

    let mut schemas = vec![cfg.power_unit_schema(tech)];
    schemas.extend(Extension::ALL.map(|ext| cfg.extension_schema(tech, ext)));
    schemas.push(unified_schema(cfg, tech)?);

    for schema in schemas {
        let path = cfg.csv_path(&schema.name);
        let name = schema.name.clone();
        let summary = load_table(db, schema, &path, &db_cfg.sink)
            .await
            .with_context(|| format!("loading table {name}"))?;
        tracing::info!(table = %name, written = summary.written, skipped = summary.skipped, "table loaded");
    }
    Ok(())
}

/// Full run over all configured technologies.
pub async fn run(cfg: &AppConfig) -> Result<()> {
    cfg.require_credentials()?;

    let db = match &cfg.database {
        Some(d) => Some(
            Database::connect(&d.uri, d.max_connections)
                .await
                .context("connecting to database")?,
        ),
        None => None,
    };
    let client = Arc::new(MastrSoapClient::new(&cfg.mastr)?);

    for tech in &cfg.technologies {
        let tech = *tech;
        let units = download_power_units(cfg, client.clone(), tech).await?;
        tracing::info!(%tech, written = units.written, duplicates = units.duplicates, skipped = units.skipped, "power units done");

        for ext in Extension::ALL {
            let details = download_extension(cfg, client.clone(), tech, ext).await?;
            tracing::info!(
                %tech,
                extension = ?ext,
                written = details.written,
                skipped = details.skipped,
                "unit details done"
            );
        }

        make_unified(cfg, tech)?;

        if let Some(db) = &db {
            load_all(cfg, db, tech).await?;
        }
    }

    Ok(())
}
