// Core modules
pub mod analysis;
pub mod api;
pub mod config;
pub mod error;
pub mod feed;
pub mod indicators;
pub mod lifecycle;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use analysis::{Analyzer, AnalyzerOptions, TrendAnalyzer};
pub use config::Settings;
pub use error::PipelineError;
pub use feed::{MarketDataFeed, MarketDataSource};
pub use lifecycle::SignalLifecycleManager;
pub use models::*;
pub use pipeline::{ConfluenceValidator, TimeframeFanout};
pub use scheduler::CycleScheduler;
pub use store::SignalStore;

pub type Result<T> = std::result::Result<T, PipelineError>;
