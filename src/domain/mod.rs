//! Domain layer for the cosci orchestration core
//!
//! This module contains the core models, the error taxonomy and the port
//! traits that adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
