//! Data models for Kimai entities.
//!
//! - `Project`, `Activity`, `Timesheet`: records returned by the Kimai REST API
//! - `ProjectProgress`: hours and revenue per project against its budgets

pub mod kimai;
pub mod progress;

pub use kimai::{Activity, Project, Timesheet};
pub use progress::ProjectProgress;
