pub mod csv_file;
pub mod database;

pub use csv_file::{write_table, CsvSink};
pub use database::DbSink;
