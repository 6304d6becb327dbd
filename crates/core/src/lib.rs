pub mod config;
pub mod errors;

pub use config::{AppConfig, ObservabilityConfig, SchedulingConfig};
pub use errors::{SchedulerError, SchedulerResult};
