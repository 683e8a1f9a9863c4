pub mod batcher;
pub mod sinks;

pub use batcher::NotificationBatcher;
pub use sinks::{LogSink, TelegramSink};
