pub mod inbound;
pub mod pending_message;

pub use inbound::*;
pub use pending_message::*;
