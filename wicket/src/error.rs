//! Common errors

use std::error::Error as StdError;

use thiserror::Error;

/// The provided name could not be matched with an accepted algorithm
///
/// Symmetric algorithms and `none` are never accepted, regardless of
/// what the credential declares.
#[derive(Debug, Error)]
#[error("'{alg}' is not an accepted signing algorithm")]
pub struct UnknownAlgorithm {
    alg: String,
}

#[inline]
pub(crate) fn unknown_algorithm(alg: String) -> UnknownAlgorithm {
    UnknownAlgorithm { alg }
}

/// The key material was rejected
#[derive(Debug, Error)]
#[error("key rejected")]
pub struct KeyRejected {
    #[from]
    source: Box<dyn StdError + Send + Sync + 'static>,
}

pub(crate) fn key_rejected(
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> KeyRejected {
    KeyRejected {
        source: source.into(),
    }
}

/// An error raised while validating a session credential
///
/// All variants are fatal to engine startup: a credential that fails
/// validation never produces an active session.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The credential was structurally invalid or missing required claims
    #[error("malformed session credential")]
    MalformedCredential(#[source] Option<Box<dyn StdError + Send + Sync + 'static>>),

    /// No key in the key set matched the credential's declared key ID,
    /// even after a refresh of the key set
    #[error("no key found matching the credential's signing key ID")]
    UnknownSigningKey,

    /// The signature did not verify against the resolved public key
    #[error("credential signature is invalid")]
    InvalidSignature,

    /// The credential's expiration is in the past
    #[error("session credential is expired")]
    Expired,

    /// The credential was issued by an unexpected issuer
    #[error("credential issuer does not match the expected issuer")]
    IssuerMismatch,

    /// The credential was issued for a different application
    #[error("credential application does not match this application")]
    ApplicationMismatch,
}

pub(crate) fn malformed(
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> CredentialError {
    CredentialError::MalformedCredential(Some(source.into()))
}

pub(crate) const fn malformed_opaque() -> CredentialError {
    CredentialError::MalformedCredential(None)
}

impl From<UnknownAlgorithm> for CredentialError {
    fn from(err: UnknownAlgorithm) -> Self {
        malformed(err)
    }
}
