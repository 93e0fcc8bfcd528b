pub mod delivery;
pub mod dispatch;
pub mod retry;
pub mod webhook;

pub use delivery::Outbound;
pub use dispatch::Dispatcher;
pub use retry::RetryScheduler;
pub use webhook::{AppState, router};
