pub mod config;
pub mod errors;
pub mod issues;
pub mod telemetry;

pub use config::Settings;
pub use errors::{ReviewError, ReviewResult};
