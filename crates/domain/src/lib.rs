//! Shared domain types, error taxonomy, configuration, identifier
//! generation, and observability wiring used by every SerialAgent core
//! crate (shared memory store, session store, queue, memory façade, and
//! messaging layer).

pub mod config;
pub mod error;
pub mod ids;
pub mod model;
pub mod observability;
pub mod trace;

pub use error::{Error, Result};
