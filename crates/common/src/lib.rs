pub mod broker;
pub mod config;
pub mod error;
pub mod market;
pub mod notification;
pub mod types;

pub use broker::BrokerAdapter;
pub use config::{Config, SafetyConfig};
pub use error::{Error, ErrorPolicy, Result};
pub use market::MarketDataSource;
pub use notification::{Notification, NotificationSink, Priority};
pub use types::*;
