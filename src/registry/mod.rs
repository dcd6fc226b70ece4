mod attributes;
pub mod proto;
#[allow(clippy::module_inception)]
mod registry;

pub use attributes::AttributeCodec;
pub use registry::{extract_sender, MessageRegistry, MsgDecoder};
