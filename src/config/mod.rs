mod settings;

pub use settings::{IndexerSettings, NodeSettings, PostgresSettings, Settings};
