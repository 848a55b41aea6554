pub mod csv_file;
pub mod soap;
pub mod xml;

pub use csv_file::{read_keys, read_table, CsvFileSource};
pub use soap::{MastrSoapClient, Page, PowerUnitListSource, SoapError, UnitDetailSource};
pub use xml::RawRecord;
