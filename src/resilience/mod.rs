mod classify;
mod manager;

pub use classify::{classify_error, ErrorClass};
pub use manager::{IndexerStatus, LastError, ResilienceManager, StatusChange};
