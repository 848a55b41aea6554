pub mod power_unit;
pub mod table;
pub mod technology;

pub use power_unit::PowerUnit;
pub use table::{Row, Table, TableSchema};
pub use technology::{Extension, Technology};
