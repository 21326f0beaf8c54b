//! Lifecycle of one CFD case backed by a remote folder.
//!
//! A case is driven by [`CfdCaseInstance`]; all remote interaction goes
//! through a [`cf_remote::RemoteDataInterface`] and all knowledge of folder
//! content comes from a shared [`cf_remote::FileTree`].

pub mod derive;
pub mod error;
pub mod instance;
pub mod lock;
pub mod notify;
pub mod state;

pub use error::{CaseError, CaseResult};
pub use instance::{CaseContext, CfdCaseInstance};
pub use lock::{EasyBoolLock, OpGuard};
pub use notify::{CaseEvent, Observers};
pub use state::{CaseState, StageState};
