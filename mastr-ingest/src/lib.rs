pub mod config;
pub mod fixtures;
pub mod jobs;
pub mod join;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod sinks;
pub mod sources;
pub mod transform;

pub use mastr_client::domain::{Extension, Row, Table, TableSchema, Technology};
pub use pipeline::{Envelope, Pipeline, SinkSummary};
