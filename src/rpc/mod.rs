pub mod client;
pub mod types;
pub mod ws;

pub use client::RpcClient;
pub use ws::{spawn_new_block_subscription, PushEvent};
