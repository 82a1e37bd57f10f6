//! # EvalFlow Core
//!
//! Shared vocabulary for the evaluation scheduler: domain types, the error
//! type, configuration, runtime settings and the collaborator traits the
//! scheduler is written against.

pub mod config;
pub mod error;
pub mod settings;
pub mod traits;
pub mod types;

pub use error::{EvalFlowError, Result};
