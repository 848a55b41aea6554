use std::{fmt, str::FromStr};

use serde::Deserialize;

/// Generation technology as filtered in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    Biomass,
    Wind,
    Solar,
    Hydro,
}

impl Technology {
    pub const ALL: [Technology; 4] = [
        Technology::Biomass,
        Technology::Wind,
        Technology::Solar,
        Technology::Hydro,
    ];

    /// Slug used in file and table names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Biomass => "biomass",
            Self::Wind => "wind",
            Self::Solar => "solar",
            Self::Hydro => "hydro",
        }
    }

    /// `energietraeger` filter value of the registry.
    pub fn energy_carrier(&self) -> &'static str {
        match self {
            Self::Biomass => "Biomasse",
            Self::Wind => "Wind",
            Self::Solar => "SolareStrahlungsenergie",
            Self::Hydro => "Wasser",
        }
    }

    fn operation_suffix(&self) -> &'static str {
        match self {
            Self::Biomass => "Biomasse",
            Self::Wind => "Wind",
            Self::Solar => "Solar",
            Self::Hydro => "Wasser",
        }
    }
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Technology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Technology::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown technology '{s}'"))
    }
}

/// Technology-specific detail table joined onto the power units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    /// Unit details, keyed by the unit registration number.
    Unit,
    /// EEG subsidy details, keyed by the EEG registration number.
    Eeg,
}

impl Extension {
    pub const ALL: [Extension; 2] = [Extension::Unit, Extension::Eeg];

    /// Column holding the join key, on both the power unit and the extension side.
    pub fn key_column(&self) -> &'static str {
        match self {
            Self::Unit => "EinheitMastrNummer",
            Self::Eeg => "EegMastrNummer",
        }
    }

    /// Request parameter carrying the key in detail lookups.
    pub fn key_param(&self) -> &'static str {
        match self {
            Self::Unit => "einheitMastrNummer",
            Self::Eeg => "eegMastrNummer",
        }
    }

    /// Suffix for extension columns that collide with columns already joined.
    pub fn join_suffix(&self) -> &'static str {
        match self {
            Self::Unit => "_w",
            Self::Eeg => "_e",
        }
    }

    /// Detail operation of the registry service for `tech`.
    pub fn operation(&self, tech: Technology) -> String {
        match self {
            Self::Unit => format!("GetEinheit{}", tech.operation_suffix()),
            Self::Eeg => format!("GetAnlageEeg{}", tech.operation_suffix()),
        }
    }

    /// Table name for `tech`, e.g. `unit_biomass_eeg`.
    pub fn table_name(&self, tech: Technology) -> String {
        match self {
            Self::Unit => format!("unit_{tech}"),
            Self::Eeg => format!("unit_{tech}_eeg"),
        }
    }
}
