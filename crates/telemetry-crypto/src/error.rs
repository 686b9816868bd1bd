//! Errors for signing, verification, and trust-map loading (§4.B, §7).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("bad signature")]
    BadSignature,

    #[error("unknown identity: {cn}")]
    UnknownIdentity { cn: String },

    #[error("identity mismatch: device_id {device_id} not allowed for CN {cn}")]
    IdentityMismatch { cn: String, device_id: String },

    #[error("trust map has duplicate CN: {cn}")]
    DuplicateCn { cn: String },

    #[error("failed to load trust map: {0}")]
    TrustMapLoad(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// The three permanent verification failure reasons from §4.B. Permanent
/// means the agent must not retry the same bytes (§4.B "Failure semantics").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailureReason {
    BadSignature,
    UnknownIdentity,
    IdentityMismatch,
}

impl VerifyFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyFailureReason::BadSignature => "BAD_SIGNATURE",
            VerifyFailureReason::UnknownIdentity => "UNKNOWN_IDENTITY",
            VerifyFailureReason::IdentityMismatch => "IDENTITY_MISMATCH",
        }
    }
}
