//! Pattern-aware scheduling engine.
//!
//! Callers hand [`SchedulingEngine`] a full snapshot (candidates, fixed blocks,
//! external calendar events, history) and receive a complete [`GeneratedSchedule`].
//! Nothing is persisted between calls.

pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use error::{AppError, AppResult};
pub use models::schedule::GeneratedSchedule;
pub use services::rescheduler::RescheduleRequest;
pub use services::schedule_service::{ScheduleRequest, SchedulingEngine};
pub use services::settings_service::EngineSettings;
pub use utils::cancellation::CancellationSignal;
