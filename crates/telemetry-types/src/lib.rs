//! Canonical data model and deterministic wire codec for the telemetry
//! fabric. No networking, persistence, or cryptography lives here — this
//! crate only defines what an envelope *is* and the exact bytes signatures
//! are computed over.

pub mod codec;
pub mod error;
pub mod model;

pub use error::{Result, TypesError};
pub use model::*;
