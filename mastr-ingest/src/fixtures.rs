//! Built-in table layouts and lookup tables.
//!
//! Column names are the registry's field names, so downloaded records map
//! onto them without renaming. The configuration file may replace the column
//! list of any table by name.

use mastr_client::domain::{Extension, TableSchema, Technology};

pub const DEFAULT_FILE_TEMPLATE: &str = "bnetza_mastr_{version}_{name}.csv";

const POWER_UNIT_COLUMNS: &[&str] = &[
    "EinheitMastrNummer",
    "Name",
    "Einheitart",
    "Einheittyp",
    "Standort",
    "Bruttoleistung",
    "Erzeugungsleistung",
    "EinheitBetriebsstatus",
    "Anlagenbetreiber",
    "EegMastrNummer",
    "KwkMastrNummer",
    "SpeMastrNummer",
    "GenMastrNummer",
    "Energietraeger",
    "Bundesland",
    "Postleitzahl",
    "Nettonennleistung",
    "Inbetriebnahmedatum",
];

/// Location and registration block shared by every unit detail record.
const UNIT_COMMON_COLUMNS: &[&str] = &[
    "EinheitMastrNummer",
    "DatumLetzteAktualisierung",
    "LokationMastrNummer",
    "NetzbetreiberpruefungStatus",
    "Land",
    "Bundesland",
    "Landkreis",
    "Gemeinde",
    "Gemeindeschluessel",
    "Postleitzahl",
    "Gemarkung",
    "FlurFlurstuecknummern",
    "Strasse",
    "Hausnummer",
    "Ort",
    "Laengengrad",
    "Breitengrad",
    "Registrierungsdatum",
    "Inbetriebnahmedatum",
    "EinheitBetriebsstatus",
    "NameStromerzeugungseinheit",
    "Weic",
    "Kraftwerksnummer",
    "Energietraeger",
    "Bruttoleistung",
    "Nettonennleistung",
    "FernsteuerbarkeitNb",
    "Einspeisungsart",
    "EegMastrNummer",
];

const BIOMASS_UNIT_COLUMNS: &[&str] = &["Hauptbrennstoff", "Biomasseart", "Technologie", "KwkMastrNummer"];

const WIND_UNIT_COLUMNS: &[&str] = &[
    "NameWindpark",
    "Lage",
    "Seelage",
    "Hersteller",
    "Technologie",
    "Typenbezeichnung",
    "Nabenhoehe",
    "Rotordurchmesser",
];

const SOLAR_UNIT_COLUMNS: &[&str] = &[
    "Lage",
    "Leistungsbegrenzung",
    "EinheitlicheAusrichtungUndNeigungswinkel",
    "Hauptausrichtung",
    "HauptausrichtungNeigungswinkel",
    "Nutzungsbereich",
    "AnzahlModule",
];

const HYDRO_UNIT_COLUMNS: &[&str] = &["ArtDerWasserkraftanlage", "ArtDesZuflusses", "MinderungStromerzeugung"];

const EEG_COMMON_COLUMNS: &[&str] = &[
    "EegMastrNummer",
    "Meldedatum",
    "DatumLetzteAktualisierung",
    "EegInbetriebnahmedatum",
    "AnlagenkennzifferAnlagenregister",
    "AnlagenschluesselEeg",
    "InstallierteLeistung",
    "VerknuepfteEinheit",
    "AusschreibungZuschlag",
    "Zuschlagsnummer",
];

const BIOMASS_EEG_COLUMNS: &[&str] = &[
    "AusschliesslicheVerwendungBiomasse",
    "BiogasInanspruchnahmeFlexiblePraemie",
    "BiogasDatumInanspruchnahmeFlexiblePraemie",
    "BiogasLeistungserhoehung",
    "BiogasHoechstbemessungsleistung",
    "BiomethanErstmaligerEinsatz",
];

const WIND_EEG_COLUMNS: &[&str] = &["PrototypAnlage", "PilotAnlage"];

const SOLAR_EEG_COLUMNS: &[&str] = &["RegistrierungsnummerPvMeldeportal"];

const HYDRO_EEG_COLUMNS: &[&str] = &["Ertuechtigung"];

/// Known mis-decodings (UTF-8 read as Latin-1) and their repairs.
/// Longer patterns come first so they win over their prefixes.
pub const ENCODING_FIXES: &[(&str, &str)] = &[
    ("â€“", "–"),
    ("â€ž", "„"),
    ("â€œ", "“"),
    ("â€™", "’"),
    ("Ã„", "Ä"),
    ("Ã–", "Ö"),
    ("Ãœ", "Ü"),
    ("Ã¤", "ä"),
    ("Ã¶", "ö"),
    ("Ã¼", "ü"),
    ("ÃŸ", "ß"),
    ("Ã©", "é"),
    ("Ã¨", "è"),
    ("Ã¡", "á"),
    ("Ã³", "ó"),
    ("Ã§", "ç"),
    ("Â°", "°"),
    ("Â²", "²"),
];

fn concat(parts: &[&[&str]]) -> Vec<String> {
    parts.iter().flat_map(|p| p.iter()).map(|s| s.to_string()).collect()
}

pub fn power_unit_table_name(tech: Technology) -> String {
    format!("power_unit_{tech}")
}

pub fn unified_table_name(tech: Technology) -> String {
    format!("{tech}_all")
}

/// Base table of all units of one technology.
pub fn power_unit_schema(tech: Technology) -> TableSchema {
    TableSchema::new(&power_unit_table_name(tech), "EinheitMastrNummer", concat(&[POWER_UNIT_COLUMNS]))
}

pub fn extension_schema(tech: Technology, ext: Extension) -> TableSchema {
    let specific: &[&str] = match (ext, tech) {
        (Extension::Unit, Technology::Biomass) => BIOMASS_UNIT_COLUMNS,
        (Extension::Unit, Technology::Wind) => WIND_UNIT_COLUMNS,
        (Extension::Unit, Technology::Solar) => SOLAR_UNIT_COLUMNS,
        (Extension::Unit, Technology::Hydro) => HYDRO_UNIT_COLUMNS,
        (Extension::Eeg, Technology::Biomass) => BIOMASS_EEG_COLUMNS,
        (Extension::Eeg, Technology::Wind) => WIND_EEG_COLUMNS,
        (Extension::Eeg, Technology::Solar) => SOLAR_EEG_COLUMNS,
        (Extension::Eeg, Technology::Hydro) => HYDRO_EEG_COLUMNS,
    };
    let common = match ext {
        Extension::Unit => UNIT_COMMON_COLUMNS,
        Extension::Eeg => EEG_COMMON_COLUMNS,
    };
    TableSchema::new(&ext.table_name(tech), ext.key_column(), concat(&[common, specific]))
}

/// All built-in schemas, in download order.
pub fn builtin_schemas() -> Vec<TableSchema> {
    let mut out = Vec::new();
    for tech in Technology::ALL {
        out.push(power_unit_schema(tech));
        for ext in Extension::ALL {
            out.push(extension_schema(tech, ext));
        }
    }
    out
}

/// Render a file name from `template`, substituting `{version}` and `{name}`.
pub fn file_name(template: &str, version: &str, name: &str) -> String {
    template.replace("{version}", version).replace("{name}", name)
}
