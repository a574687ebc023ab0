pub mod calendar_integrator;
pub mod conflict_detector;
pub mod conflict_resolver;
pub mod pattern_model;
pub mod placer;
pub mod rescheduler;
pub mod schedule_service;
pub mod schedule_utils;
pub mod settings_service;
