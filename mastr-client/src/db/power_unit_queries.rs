use anyhow::Result;

use super::{quote_ident, Database};
use crate::domain::PowerUnit;

const POWER_UNIT_COLUMNS: [&str; 8] = [
    "EinheitMastrNummer",
    "EegMastrNummer",
    "Energietraeger",
    "Bundesland",
    "Postleitzahl",
    "Nettonennleistung",
    "Inbetriebnahmedatum",
    "EinheitBetriebsstatus",
];

fn blank_to_none(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

/// Fetch a single power unit by registration number from `table`.
///
/// The table must carry every column of [`PowerUnit`]; the built-in power
/// unit schemas do.
pub async fn fetch_power_unit(db: &Database, table: &str, mastr_id: &str) -> Result<Option<PowerUnit>> {
    let cols = POWER_UNIT_COLUMNS
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let key = quote_ident("EinheitMastrNummer");

    let unit = match db {
        Database::Postgres(pool) => {
            let sql = format!("SELECT {cols} FROM {} WHERE {key} = $1", quote_ident(table));
            sqlx::query_as::<_, PowerUnit>(&sql)
                .bind(mastr_id)
                .fetch_optional(pool)
                .await?
        }
        Database::Sqlite(pool) => {
            let sql = format!("SELECT {cols} FROM {} WHERE {key} = ?", quote_ident(table));
            sqlx::query_as::<_, PowerUnit>(&sql)
                .bind(mastr_id)
                .fetch_optional(pool)
                .await?
        }
    };

    Ok(unit.map(|u| PowerUnit {
        eeg_mastr_id: blank_to_none(u.eeg_mastr_id),
        energy_carrier: blank_to_none(u.energy_carrier),
        state: blank_to_none(u.state),
        postcode: blank_to_none(u.postcode),
        net_capacity: blank_to_none(u.net_capacity),
        commissioning_date: blank_to_none(u.commissioning_date),
        status: blank_to_none(u.status),
        mastr_id: u.mastr_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TableSchema;

    #[tokio::test]
    async fn fetches_typed_unit() -> Result<()> {
        let db = Database::connect("sqlite::memory:", 1).await?;
        let schema = TableSchema::new("power_unit_biomass", "EinheitMastrNummer", POWER_UNIT_COLUMNS);
        db.ensure_table(&schema).await?;
        let row: Vec<String> = ["SEE1", "", "Biomasse", "Bayern", "80331", "250.0", "2010-01-01", "InBetrieb"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        db.upsert_rows(&schema, &[row]).await?;

        let unit = fetch_power_unit(&db, "power_unit_biomass", "SEE1").await?.expect("unit");
        assert_eq!(unit.eeg_mastr_id, None);
        assert_eq!(unit.state.as_deref(), Some("Bayern"));
        assert_eq!(unit.net_capacity_kw(), Some(250.0));

        assert!(fetch_power_unit(&db, "power_unit_biomass", "SEE2").await?.is_none());
        Ok(())
    }
}
