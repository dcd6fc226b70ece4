mod block;
mod checkpoint;
mod event;
mod transaction;

pub use block::{Block, BlockSignature};
pub use checkpoint::{Checkpoint, JOB_BLOCK_CRAWL, JOB_TX_CRAWL};
pub use event::{Event, EventAttribute, EventSource};
pub use transaction::{Transaction, TransactionMessage};
