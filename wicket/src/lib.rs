//! Verification of signed marketplace session credentials
//!
//! A marketplace issues a signed, time-bounded credential and hands it to
//! a partner application in a redirect URL. This crate models the subset
//! of the JOSE standards needed to take such a credential from raw text to
//! a set of claims the embedding application can trust:
//!
//! * [`jwa`]: the accepted (asymmetric-only) signing algorithms
//! * [`jwk`] and the [`Jwks`] set: the issuer's published public keys
//! * [`credential`]: decomposition, signature verification, and claims
//!   validation with a configurable clock-skew allowance
//!
//! ```
//! use wicket::credential::{CredentialValidator, Issuer, SessionTokenRef};
//!
//! let validator = CredentialValidator::new(Issuer::from_static("https://market.example.com"));
//!
//! let token = SessionTokenRef::from_str("not.a.credential");
//! let decomposed = token.decompose();
//! assert!(decomposed.is_err());
//! # let _ = validator;
//! ```
//!
//! Key fetching and caching are deliberately out of this crate; see the
//! `wicket_engine` crate's key authority for the networked layer.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod b64;
pub mod credential;
pub mod error;
pub mod jwa;
pub mod jwk;
mod jwks;

pub use credential::{
    AppId, AppIdRef, Issuer, IssuerRef, OrgId, OrgIdRef, SessionId, SessionIdRef, SessionToken,
    SessionTokenRef, Subject, SubjectRef, ValidatedSession,
};
pub use error::CredentialError;
pub use jwk::Jwk;
pub use jwks::Jwks;
