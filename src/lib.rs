pub mod config;
pub mod cron;
pub mod db;
pub mod registry;
pub mod resilience;
pub mod rpc;
pub mod sync;

pub use config::Settings;
pub use cron::CronScheduler;
pub use db::PostgresClient;
pub use registry::{AttributeCodec, MessageRegistry};
pub use resilience::ResilienceManager;
pub use rpc::RpcClient;
pub use sync::{BlockSyncEngine, TxPipeline};
