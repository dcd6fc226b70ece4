pub mod engine;
pub mod txs;

pub use engine::{BlockSyncEngine, TickTrigger};
pub use txs::TxPipeline;
