// Per-instrument analysis: horizon fanout, then cross-horizon confluence
pub mod confluence;
pub mod fanout;

pub use confluence::{ConfluenceConfig, ConfluenceValidator};
pub use fanout::{setup_count, HorizonOutcome, HorizonResult, SkipReason, TimeframeFanout};
