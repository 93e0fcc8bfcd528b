pub mod ai;
pub mod completion_client;
pub mod graph_client;

pub use ai::*;
pub use graph_client::{Ack, DeliveryClient, GraphClient, preview};
