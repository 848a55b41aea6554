use anyhow::{bail, Context, Result};
use mastr_client::db::Database;
use mastr_ingest::{config::AppConfig, jobs, observability};
use std::{env, path::PathBuf};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: load_csv <table_name> [csv_file_path]");
    }
    let table = &args[1];

    // Credentials are not needed; only the database section and schemas are used.
    let cfg = AppConfig::load()?;
    let Some(db_cfg) = &cfg.database else {
        bail!("no [database] section configured");
    };

    let schema = jobs::resolve_schema(&cfg, table)?;
    let path = match args.get(2) {
        Some(p) => PathBuf::from(p),
        None => cfg.csv_path(&schema.name),
    };

    let db = Database::connect(&db_cfg.uri, db_cfg.max_connections)
        .await
        .context("connecting to database")?;

    let summary = jobs::load_table(&db, schema, &path, &db_cfg.sink).await?;
    let total = db.count_rows(table).await?;
    tracing::info!(
        table = %table,
        written = summary.written,
        skipped = summary.skipped,
        total,
        "load finished"
    );

    Ok(())
}
