use time::{macros::format_description, Date};

use super::table::Table;

/// Typed view of one base power unit row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PowerUnit {
    #[sqlx(rename = "EinheitMastrNummer")]
    pub mastr_id: String,
    #[sqlx(rename = "EegMastrNummer")]
    pub eeg_mastr_id: Option<String>,
    #[sqlx(rename = "Energietraeger")]
    pub energy_carrier: Option<String>,
    #[sqlx(rename = "Bundesland")]
    pub state: Option<String>,
    #[sqlx(rename = "Postleitzahl")]
    pub postcode: Option<String>,
    #[sqlx(rename = "Nettonennleistung")]
    pub net_capacity: Option<String>,
    #[sqlx(rename = "Inbetriebnahmedatum")]
    pub commissioning_date: Option<String>,
    #[sqlx(rename = "EinheitBetriebsstatus")]
    pub status: Option<String>,
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

impl PowerUnit {
    /// Build from row `idx` of a power unit table. Returns `None` when the row
    /// is missing or has no registration number.
    pub fn from_table(table: &Table, idx: usize) -> Option<Self> {
        let get = |col: &str| non_empty(table.value(idx, col));

        Some(Self {
            mastr_id: get("EinheitMastrNummer")?,
            eeg_mastr_id: get("EegMastrNummer"),
            energy_carrier: get("Energietraeger"),
            state: get("Bundesland"),
            postcode: get("Postleitzahl"),
            net_capacity: get("Nettonennleistung"),
            commissioning_date: get("Inbetriebnahmedatum"),
            status: get("EinheitBetriebsstatus"),
        })
    }

    /// Net rated capacity in kW. The registry uses a decimal point.
    pub fn net_capacity_kw(&self) -> Option<f64> {
        self.net_capacity.as_deref()?.trim().parse().ok()
    }

    /// Commissioning date; accepts plain dates and date-time values.
    pub fn commissioned_on(&self) -> Option<Date> {
        let raw = self.commissioning_date.as_deref()?.trim();
        let date_part = raw.get(..10)?;
        Date::parse(date_part, format_description!("[year]-[month]-[day]")).ok()
    }
}
