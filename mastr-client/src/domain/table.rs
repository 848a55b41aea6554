use std::collections::HashSet;

use serde::Deserialize;

/// One row of string values, ordered like the owning schema's columns.
pub type Row = Vec<String>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema '{0}' has no columns")]
    NoColumns(String),
    #[error("schema '{schema}': key column '{key}' is not among its columns")]
    MissingKey { schema: String, key: String },
    #[error("schema '{schema}': required column '{column}' is not among its columns")]
    MissingRequired { schema: String, column: String },
    #[error("schema '{schema}': duplicate column '{column}'")]
    DuplicateColumn { schema: String, column: String },
    #[error("'{0}' is not a valid SQL identifier")]
    InvalidIdentifier(String),
}

/// Column layout of one CSV file / database table.
///
/// `name` doubles as the database table name, so it and every column must be
/// a plain identifier (ASCII letters, digits, underscore).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub key: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl TableSchema {
    pub fn new<I, S>(name: &str, key: &str, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            key: key.to_string(),
            columns: columns.into_iter().map(Into::into).collect(),
            required: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Index of the key column. Only meaningful after `validate` succeeded;
    /// falls back to the first column otherwise.
    pub fn key_index(&self) -> usize {
        self.column_index(&self.key).unwrap_or(0)
    }

    /// Required columns; the key is always required.
    pub fn required_columns(&self) -> Vec<&str> {
        let mut out = vec![self.key.as_str()];
        for c in &self.required {
            if c != &self.key {
                out.push(c.as_str());
            }
        }
        out
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if !is_identifier(&self.name) {
            return Err(SchemaError::InvalidIdentifier(self.name.clone()));
        }
        if self.columns.is_empty() {
            return Err(SchemaError::NoColumns(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for c in &self.columns {
            if !is_identifier(c) {
                return Err(SchemaError::InvalidIdentifier(c.clone()));
            }
            if !seen.insert(c.as_str()) {
                return Err(SchemaError::DuplicateColumn {
                    schema: self.name.clone(),
                    column: c.clone(),
                });
            }
        }

        if !seen.contains(self.key.as_str()) {
            return Err(SchemaError::MissingKey {
                schema: self.name.clone(),
                key: self.key.clone(),
            });
        }
        for r in &self.required {
            if !seen.contains(r.as_str()) {
                return Err(SchemaError::MissingRequired {
                    schema: self.name.clone(),
                    column: r.clone(),
                });
            }
        }

        Ok(())
    }
}

pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// In-memory table of string cells with a named key column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub key: String,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(columns: Vec<String>, key: &str) -> Self {
        Self {
            columns,
            key: key.to_string(),
            rows: Vec::new(),
        }
    }

    /// An empty table with the schema's header.
    pub fn empty(schema: &TableSchema) -> Self {
        Self::new(schema.columns.clone(), &schema.key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn key_index(&self) -> Option<usize> {
        self.column_index(&self.key)
    }

    /// Cell value by row index and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx).map(String::as_str)
    }

    /// Non-empty values of `column`, in row order.
    pub fn column_values(&self, column: &str) -> Vec<String> {
        let Some(idx) = self.column_index(column) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter_map(|r| r.get(idx))
            .filter(|v| !v.is_empty())
            .cloned()
            .collect()
    }

    /// Row whose key column equals `key`. First match wins.
    pub fn find(&self, key: &str) -> Option<&Row> {
        let idx = self.key_index()?;
        self.rows
            .iter()
            .find(|r| r.get(idx).map(String::as_str) == Some(key))
    }

    /// Schema describing this table under `name`.
    pub fn schema(&self, name: &str) -> TableSchema {
        TableSchema::new(name, &self.key, self.columns.iter().cloned())
    }
}
