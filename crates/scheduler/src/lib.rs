pub mod runner;
pub mod tasks;

pub use runner::{Scheduler, Task};
pub use tasks::{ArchivePurge, CycleCheck, GateRefresh, NotificationFlush, TradingTick};
