//! Application layer shared by front ends.
//!
//! Owns the file tree, the remote backend and every open case, and runs the
//! event loop that connects them.

pub mod config;
pub mod driver;
pub mod error;

pub use config::DriverConfig;
pub use driver::{CaseDriver, CaseSummary, local_driver, load_case_types};
pub use error::{AppError, AppResult};
