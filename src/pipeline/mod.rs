//! Extract and load stages and the driver that sequences them per table

pub mod connector;
pub mod driver;
pub mod error;
pub mod extractor;
pub mod loader;

pub use connector::{Destination, Source};
pub use driver::{Pipeline, TableOutcome, TableReport};
pub use error::{ExtractError, LoadError, SourceError};
pub use extractor::Extractor;
pub use loader::{LoadReceipt, Loader};
