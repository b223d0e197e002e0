//! Normalization, option resolution and record mapping from raw Bitable rows to
//! canonical funds.

use thiserror::Error;

pub mod mapper;
pub mod normalize;
pub mod options;
pub mod profile;

pub use mapper::{MappedRecord, RecordMapper};
pub use normalize::{FieldHint, Normalizer, Scalar};
pub use options::OptionResolver;
pub use profile::{CanonicalField, TableProfile, TableRegistry, TableRole};

pub const CRATE_NAME: &str = "fundsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid table configuration: {0}")]
    Config(String),
    #[error("table {0} is not configured")]
    UnknownTable(String),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}
