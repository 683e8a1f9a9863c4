pub mod feed;
pub mod rest;
pub mod sim;

pub use feed::{RestMarketData, SimMarketData};
pub use rest::RestBroker;
pub use sim::SimBroker;
