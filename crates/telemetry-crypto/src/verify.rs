//! Broker-side verification (§4.B).

use ed25519_dalek::{Signature, Verifier as _};
use telemetry_types::{codec, Envelope};

use crate::error::VerifyFailureReason;
use crate::trust::TrustMapSnapshot;

/// Outcome of `verify`. Modeled as a closed enum rather than `Result` with a
/// generic error: a `BAD_SIGNATURE` / `UNKNOWN_IDENTITY` / `IDENTITY_MISMATCH`
/// distinction is a normal broker response (§4.F step 4), not a Rust-level
/// error condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    Invalid(VerifyFailureReason),
}

/// Verify `envelope` was signed by the key the trust map associates with
/// `peer_cn`, and that the envelope's declared `device_id` is allowed for
/// that identity.
pub fn verify(envelope: &Envelope, peer_cn: &str, trust: &TrustMapSnapshot) -> VerifyOutcome {
    let Some(entry) = trust.lookup(peer_cn) else {
        return VerifyOutcome::Invalid(VerifyFailureReason::UnknownIdentity);
    };

    if !envelope
        .device_id()
        .starts_with(&entry.allowed_device_id_prefix)
    {
        return VerifyOutcome::Invalid(VerifyFailureReason::IdentityMismatch);
    }

    let Some(sig_bytes) = envelope.signature.as_deref() else {
        return VerifyOutcome::Invalid(VerifyFailureReason::BadSignature);
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes) else {
        return VerifyOutcome::Invalid(VerifyFailureReason::BadSignature);
    };
    let signature = Signature::from_bytes(&sig_array);
    let canonical_bytes = codec::canonical(envelope);

    match entry.verifying_key.verify(&canonical_bytes, &signature) {
        Ok(()) => VerifyOutcome::Ok,
        Err(_) => VerifyOutcome::Invalid(VerifyFailureReason::BadSignature),
    }
}
