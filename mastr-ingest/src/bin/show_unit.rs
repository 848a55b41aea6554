use anyhow::{bail, Context, Result};
use mastr_client::db::{power_unit_queries::fetch_power_unit, Database};
use mastr_ingest::{config::AppConfig, observability, Technology};
use std::env;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: show_unit <technology> <EinheitMastrNummer>");
    }
    let tech: Technology = args[1].parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let mastr_id = &args[2];

    let cfg = AppConfig::load()?;
    let Some(db_cfg) = &cfg.database else {
        bail!("no [database] section configured");
    };
    let table = cfg.power_unit_schema(tech).name;

    let db = Database::connect(&db_cfg.uri, db_cfg.max_connections)
        .await
        .context("connecting to database")?;

    let Some(unit) = fetch_power_unit(&db, &table, mastr_id).await? else {
        bail!("unit {mastr_id} not found in {table}");
    };

    tracing::info!(
        mastr_id = %unit.mastr_id,
        eeg_mastr_id = ?unit.eeg_mastr_id,
        state = ?unit.state,
        status = ?unit.status,
        net_capacity_kw = ?unit.net_capacity_kw(),
        commissioned_on = ?unit.commissioned_on(),
        "power unit"
    );
    Ok(())
}
