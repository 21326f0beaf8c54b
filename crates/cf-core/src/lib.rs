//! cf-core: stable foundation for cfdflow.
//!
//! Contains:
//! - ids (compact identifiers for tree nodes, requests, listeners)
//! - path (normalized remote paths)
//! - error (shared error types)

pub mod error;
pub mod ids;
pub mod path;

pub use error::{CoreError, CoreResult};
pub use ids::*;
pub use path::RemotePath;
