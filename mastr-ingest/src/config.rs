use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use mastr_client::domain::{table::SchemaError, Extension, TableSchema, Technology};
use serde::Deserialize;

use crate::fixtures;

/// Registry limit for records per list request.
pub const MAX_PAGE_SIZE: usize = 2000;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("schema override for unknown table '{0}'")]
    UnknownSchema(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("registry credentials missing; set mastr.api_key and mastr.market_actor or MASTR_API_KEY and MASTR_USER")]
    MissingCredentials,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MastrConfig {
    pub endpoint: String,
    pub namespace: String,
    pub api_key: String,
    pub market_actor: String,
    pub list_operation: String,
    /// Element wrapping one unit in list responses.
    pub list_record_tag: String,
    pub page_size: usize,
    /// Stop listing after this many records.
    pub limit: Option<usize>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Give up listing after this many skipped pages in a row.
    pub max_consecutive_failures: u32,
}

impl Default for MastrConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://www.marktstammdatenregister.de/MaStRAPI/Anlage".to_string(),
            namespace: "https://www.marktstammdatenregister.de/Services/Public/1_2/Anlage".to_string(),
            api_key: String::new(),
            market_actor: String::new(),
            list_operation: "GetGefilterteListeStromErzeuger".to_string(),
            list_record_tag: "Einheiten".to_string(),
            page_size: MAX_PAGE_SIZE,
            limit: None,
            timeout_secs: 60,
            max_retries: 3,
            retry_backoff_ms: 1000,
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub sink: SinkConfig,
}

fn default_max_connections() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaOverride {
    pub columns: Option<Vec<String>>,
    pub required: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub technologies: Vec<Technology>,
    pub data_dir: PathBuf,
    pub data_version: String,
    pub file_template: String,
    pub mastr: MastrConfig,
    pub database: Option<DatabaseConfig>,
    pub metrics: Option<MetricsConfig>,
    pub schemas: BTreeMap<String, SchemaOverride>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            technologies: vec![Technology::Biomass],
            data_dir: PathBuf::from("data"),
            data_version: "dev".to_string(),
            file_template: fixtures::DEFAULT_FILE_TEMPLATE.to_string(),
            mastr: MastrConfig::default(),
            database: None,
            metrics: None,
            schemas: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Load from `MASTR_CONFIG` (default `mastr-config.toml`), apply
    /// credential env overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("MASTR_CONFIG").unwrap_or_else(|_| "mastr-config.toml".to_string());
        let mut cfg = Self::from_file(Path::new(&path))?;

        if let Ok(key) = env::var("MASTR_API_KEY") {
            cfg.mastr.api_key = key;
        }
        if let Ok(user) = env::var("MASTR_USER") {
            cfg.mastr.market_actor = user;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.technologies.is_empty() {
            return Err(ConfigError::Invalid("no technologies configured".to_string()));
        }
        if self.data_version.trim().is_empty() {
            return Err(ConfigError::Invalid("data_version must not be empty".to_string()));
        }
        if !self.file_template.contains("{name}") {
            return Err(ConfigError::Invalid("file_template must contain {name}".to_string()));
        }
        if self.mastr.page_size == 0 || self.mastr.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "mastr.page_size must be within 1..={MAX_PAGE_SIZE}"
            )));
        }
        if self.mastr.list_record_tag.trim().is_empty() {
            return Err(ConfigError::Invalid("mastr.list_record_tag must not be empty".to_string()));
        }
        if let Some(db) = &self.database {
            if db.sink.batch_size == 0 {
                return Err(ConfigError::Invalid("database.sink.batch_size must be positive".to_string()));
            }
        }

        let known: Vec<String> = fixtures::builtin_schemas().into_iter().map(|s| s.name).collect();
        for name in self.schemas.keys() {
            if !known.contains(name) {
                return Err(ConfigError::UnknownSchema(name.clone()));
            }
        }

        for tech in &self.technologies {
            self.power_unit_schema(*tech).validate()?;
            for ext in Extension::ALL {
                self.extension_schema(*tech, ext).validate()?;
            }
        }

        Ok(())
    }

    /// Downloads need credentials; joins and loads do not.
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        if self.mastr.api_key.trim().is_empty() || self.mastr.market_actor.trim().is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        Ok(())
    }

    fn apply_override(&self, mut schema: TableSchema) -> TableSchema {
        if let Some(o) = self.schemas.get(&schema.name) {
            if let Some(cols) = &o.columns {
                schema.columns = cols.clone();
            }
            if let Some(req) = &o.required {
                schema.required = req.clone();
            }
        }
        schema
    }

    pub fn power_unit_schema(&self, tech: Technology) -> TableSchema {
        self.apply_override(fixtures::power_unit_schema(tech))
    }

    pub fn extension_schema(&self, tech: Technology, ext: Extension) -> TableSchema {
        self.apply_override(fixtures::extension_schema(tech, ext))
    }

    /// Output path of the CSV file for table `name`.
    pub fn csv_path(&self, name: &str) -> PathBuf {
        self.data_dir
            .join(fixtures::file_name(&self.file_template, &self.data_version, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        technologies = ["biomass", "wind"]
        data_dir = "out"
        data_version = "rli_v3"

        [mastr]
        api_key = "secret"
        market_actor = "SOM123"
        page_size = 500
        limit = 1000

        [database]
        uri = "sqlite://mastr.db"

        [database.sink]
        batch_size = 100

        [schemas.unit_biomass]
        columns = ["EinheitMastrNummer", "Hauptbrennstoff"]
        required = ["Hauptbrennstoff"]
    "#;

    #[test]
    fn parses_sample_with_defaults() {
        let cfg = AppConfig::from_toml_str(SAMPLE).expect("parse");
        cfg.validate().expect("valid");
        cfg.require_credentials().expect("credentials");

        assert_eq!(cfg.technologies, vec![Technology::Biomass, Technology::Wind]);
        assert_eq!(cfg.mastr.page_size, 500);
        assert_eq!(cfg.mastr.limit, Some(1000));
        assert_eq!(cfg.mastr.max_retries, 3);
        let db = cfg.database.as_ref().expect("database");
        assert_eq!(db.max_connections, 4);
        assert_eq!(db.sink.batch_size, 100);
        assert_eq!(db.sink.max_retries, 3);
        assert_eq!(
            cfg.csv_path("unit_biomass"),
            PathBuf::from("out").join("bnetza_mastr_rli_v3_unit_biomass.csv")
        );
    }

    #[test]
    fn schema_override_replaces_columns() {
        let cfg = AppConfig::from_toml_str(SAMPLE).expect("parse");
        let s = cfg.extension_schema(Technology::Biomass, Extension::Unit);
        assert_eq!(s.columns, vec!["EinheitMastrNummer", "Hauptbrennstoff"]);
        assert_eq!(s.required_columns(), vec!["EinheitMastrNummer", "Hauptbrennstoff"]);

        let untouched = cfg.extension_schema(Technology::Wind, Extension::Unit);
        assert!(untouched.columns.len() > 2);
    }

    #[test]
    fn rejects_invalid_settings() {
        let cfg = AppConfig::from_toml_str("technologies = []").expect("parse");
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let cfg = AppConfig::from_toml_str("[mastr]\npage_size = 5000").expect("parse");
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let cfg = AppConfig::from_toml_str("[schemas.unit_coal]\ncolumns = [\"x\"]").expect("parse");
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownSchema(_))));

        let cfg = AppConfig::from_toml_str("[schemas.unit_biomass]\ncolumns = [\"Hauptbrennstoff\"]").expect("parse");
        assert!(matches!(cfg.validate(), Err(ConfigError::Schema(_))));

        assert!(matches!(
            AppConfig::from_toml_str("technologies = [\"coal\"]"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_credentials_are_reported() {
        let cfg = AppConfig::default();
        cfg.validate().expect("defaults are valid");
        assert!(matches!(cfg.require_credentials(), Err(ConfigError::MissingCredentials)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = AppConfig::from_file(Path::new("/nonexistent/mastr.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
