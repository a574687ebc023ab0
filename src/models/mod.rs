pub mod calendar;
pub mod candidate;
pub mod conflict;
pub mod constraint;
pub mod disruption;
pub mod pattern;
pub mod schedule;
pub mod time_block;
