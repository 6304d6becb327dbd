pub mod entities;
pub mod ports;
pub mod repositories;
pub mod value_objects;

pub use entities::*;
pub use exercise_scheduler_core::{SchedulerError, SchedulerResult};
pub use ports::*;
pub use repositories::*;
pub use value_objects::*;
