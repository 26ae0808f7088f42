//! camreel Common Utilities
//!
//! Shared infrastructure for all camreel crates:
//! - Error taxonomy and result aliases
//! - Configuration, encoding profiles, and lenient config validation
//! - Progress clock and ETA extrapolation
//! - Tracing/logging initialization

pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use cancel::*;
pub use clock::*;
pub use config::*;
pub use error::*;
