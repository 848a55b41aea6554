pub mod power_unit_queries;

use std::{collections::HashMap, str::FromStr};

use anyhow::{bail, Result};
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Postgres, QueryBuilder, Row as _, Sqlite,
};

use crate::domain::{Row, Table, TableSchema};

/// Stay well below the bind parameter limits of both backends.
const MAX_BIND_PARAMS: usize = 30_000;

/// Relational store for downloaded tables.
#[derive(Clone, Debug)]
pub enum Database {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn column_list(schema: &TableSchema) -> String {
    schema
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn create_table_sql(schema: &TableSchema) -> String {
    let cols = schema
        .columns
        .iter()
        .map(|c| {
            if *c == schema.key {
                format!("{} TEXT NOT NULL", quote_ident(c))
            } else {
                format!("{} TEXT", quote_ident(c))
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
        quote_ident(&schema.name),
        cols,
        quote_ident(&schema.key)
    )
}

fn insert_prefix(schema: &TableSchema) -> String {
    format!("INSERT INTO {} ({}) ", quote_ident(&schema.name), column_list(schema))
}

fn conflict_clause(schema: &TableSchema) -> String {
    let updates = schema
        .columns
        .iter()
        .filter(|c| **c != schema.key)
        .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
        .collect::<Vec<_>>();

    if updates.is_empty() {
        format!(" ON CONFLICT ({}) DO NOTHING", quote_ident(&schema.key))
    } else {
        format!(" ON CONFLICT ({}) DO UPDATE SET {}", quote_ident(&schema.key), updates.join(", "))
    }
}

fn pg_upsert<'a>(schema: &TableSchema, rows: &[&'a Row]) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(insert_prefix(schema));
    builder.push_values(rows.iter().copied(), |mut b, row| {
        for v in row {
            b.push_bind(v.as_str());
        }
    });
    builder.push(conflict_clause(schema));
    builder
}

fn sqlite_upsert<'a>(schema: &TableSchema, rows: &[&'a Row]) -> QueryBuilder<'a, Sqlite> {
    let mut builder = QueryBuilder::<Sqlite>::new(insert_prefix(schema));
    builder.push_values(rows.iter().copied(), |mut b, row| {
        for v in row {
            b.push_bind(v.as_str());
        }
    });
    builder.push(conflict_clause(schema));
    builder
}

fn select_sql(schema: &TableSchema) -> String {
    format!(
        "SELECT {} FROM {} ORDER BY {}",
        column_list(schema),
        quote_ident(&schema.name),
        quote_ident(&schema.key)
    )
}

/// Collapse rows sharing a key; the last one wins and takes the first one's slot.
fn dedup_last_wins<'a>(key_idx: usize, rows: &'a [Row]) -> Vec<&'a Row> {
    let mut slots: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<&Row> = Vec::with_capacity(rows.len());
    for row in rows {
        let key = row.get(key_idx).map(String::as_str).unwrap_or("");
        match slots.get(key) {
            Some(&i) => out[i] = row,
            None => {
                slots.insert(key, out.len());
                out.push(row);
            }
        }
    }
    out
}

impl Database {
    /// Connect by URI scheme: `postgres://`/`postgresql://` or `sqlite:`.
    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self> {
        if uri.starts_with("postgres://") || uri.starts_with("postgresql://") {
            let pool = PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(uri)
                .await?;
            Ok(Self::Postgres(pool))
        } else if uri.starts_with("sqlite:") {
            // Every connection to an in-memory database is a separate database.
            let max = if uri.contains(":memory:") { 1 } else { max_connections };
            let opts = SqliteConnectOptions::from_str(uri)?.create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(max)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await?;
            Ok(Self::Sqlite(pool))
        } else {
            bail!("unsupported database uri '{uri}'; expected postgres:// or sqlite:")
        }
    }

    pub async fn execute(&self, sql: &str) -> Result<u64, sqlx::Error> {
        let done = match self {
            Self::Postgres(pool) => sqlx::query(sql).execute(pool).await?.rows_affected(),
            Self::Sqlite(pool) => sqlx::query(sql).execute(pool).await?.rows_affected(),
        };
        Ok(done)
    }

    /// Create the schema's table with TEXT columns if it does not exist yet.
    pub async fn ensure_table(&self, schema: &TableSchema) -> Result<(), sqlx::Error> {
        self.execute(&create_table_sql(schema)).await.map(|_| ())
    }

    /// Insert rows, replacing the non-key columns of rows whose key already
    /// exists. Every row must carry one value per schema column.
    pub async fn upsert_rows(&self, schema: &TableSchema, rows: &[Row]) -> Result<u64, sqlx::Error> {
        let width = schema.columns.len().max(1);
        let rows = dedup_last_wins(schema.key_index(), rows);
        let per_statement = (MAX_BIND_PARAMS / width).max(1);

        let mut affected = 0;
        for chunk in rows.chunks(per_statement) {
            affected += match self {
                Self::Postgres(pool) => pg_upsert(schema, chunk).build().execute(pool).await?.rows_affected(),
                Self::Sqlite(pool) => sqlite_upsert(schema, chunk).build().execute(pool).await?.rows_affected(),
            };
        }
        Ok(affected)
    }

    /// Read the whole table back, ordered by key. NULL cells become empty strings.
    pub async fn fetch_table(&self, schema: &TableSchema) -> Result<Table> {
        let sql = select_sql(schema);
        let width = schema.columns.len();
        let mut table = Table::empty(schema);

        match self {
            Self::Postgres(pool) => {
                for row in sqlx::query(&sql).fetch_all(pool).await? {
                    let mut out = Vec::with_capacity(width);
                    for i in 0..width {
                        out.push(row.try_get::<Option<String>, _>(i)?.unwrap_or_default());
                    }
                    table.rows.push(out);
                }
            }
            Self::Sqlite(pool) => {
                for row in sqlx::query(&sql).fetch_all(pool).await? {
                    let mut out = Vec::with_capacity(width);
                    for i in 0..width {
                        out.push(row.try_get::<Option<String>, _>(i)?.unwrap_or_default());
                    }
                    table.rows.push(out);
                }
            }
        }

        Ok(table)
    }

    pub async fn count_rows(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let n = match self {
            Self::Postgres(pool) => sqlx::query(&sql).fetch_one(pool).await?.try_get::<i64, _>(0)?,
            Self::Sqlite(pool) => sqlx::query(&sql).fetch_one(pool).await?.try_get::<i64, _>(0)?,
        };
        Ok(n)
    }
}
