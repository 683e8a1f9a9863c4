pub mod check;
pub mod gate;

pub use check::{default_checks, CheckContext, CheckOutcome, SafetyCheck};
pub use gate::{CheckState, SafetyGate, Verdict};
