pub mod app;
pub mod cli;
pub mod clock;
pub mod config;
pub mod model;
pub mod recurrence;
pub mod reminders;
pub mod search;
pub mod storage;

pub use app::Planner;
pub use config::{AppConfig, ConfigLoader, ConfigPaths};
