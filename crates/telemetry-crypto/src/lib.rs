//! Ed25519 signing, verification, and trust-map lookups for the telemetry
//! fabric (§4.B).

pub mod error;
pub mod sign;
pub mod trust;
pub mod verify;

pub use error::{CryptoError, Result, VerifyFailureReason};
pub use sign::Signer;
pub use trust::{TrustEntry, TrustMap, TrustMapSnapshot};
pub use verify::{verify, VerifyOutcome};
