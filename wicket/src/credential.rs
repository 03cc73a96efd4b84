//! The signed session credential issued by the marketplace
//!
//! A credential arrives as a three-part compact encoding, where each part
//! is base64url and the parts are separated by `.`: a header naming the
//! signing algorithm and key, a claims payload describing the session, and
//! the signature over the first two parts.
//!
//! Nothing in the header or payload may be trusted before the signature
//! has been verified against a key from the issuer's published key set.

use std::fmt;

use aliri_braid::braid;
use serde::{Deserialize, Serialize};
use wicket_clock::{Clock, DurationSecs, UnixTime};

use crate::{b64, error, jwa, jwk, Jwk};

/// The issuer of session credentials
#[braid(serde, ref_doc = "A borrowed reference to an [`Issuer`]")]
pub struct Issuer;

/// The marketplace user a session belongs to
#[braid(serde, ref_doc = "A borrowed reference to a [`Subject`]")]
pub struct Subject;

/// The marketplace organization a session was purchased under
#[braid(serde, ref_doc = "A borrowed reference to an [`OrgId`]")]
pub struct OrgId;

/// The partner application a session grants access to
#[braid(serde, ref_doc = "A borrowed reference to an [`AppId`]")]
pub struct AppId;

/// The identifier of a single logical session
#[braid(serde, ref_doc = "A borrowed reference to a [`SessionId`]")]
pub struct SessionId;

/// A raw, signed session credential
///
/// This type provides custom implementations of [`Display`][SessionTokenRef#impl-Display]
/// and [`Debug`][SessionTokenRef#impl-Debug] to prevent unintentional disclosure of the
/// signed credential in logs.
#[braid(
    serde,
    debug = "owned",
    display = "owned",
    ord = "omit",
    ref_doc = "\
    A borrowed reference to a raw session credential ([`SessionToken`])\n\
    \n\
    This type provides custom implementations of [`Display`][Self#impl-Display] and \
    [`Debug`][Self#impl-Debug] to prevent unintentional disclosure of the signed \
    credential in logs.
    "
)]
#[must_use]
pub struct SessionToken;

/// Masks the token value by default. The alternate format (`{:#?}`) prints
/// the header and payload sections but elides the signature.
impl fmt::Debug for SessionTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            match self.0.rfind('.') {
                Some(idx) => write!(f, "\"{}…\"", &self.0[..=idx]),
                None => write!(f, "\"…\""),
            }
        } else {
            f.write_str("***SESSION TOKEN***")
        }
    }
}

/// Masks the token value unless the alternate format (`{:#}`) is requested.
impl fmt::Display for SessionTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            f.write_str(&self.0)
        } else {
            f.write_str("***SESSION TOKEN***")
        }
    }
}

/// The decoded header of a session credential
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// The declared signing algorithm
    pub alg: jwa::Algorithm,

    /// The ID of the key that produced the signature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<jwk::KeyId>,
}

/// The verified claims of a session credential
///
/// Field names on the wire follow the issuer's camel-cased convention.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// The issuer of the credential
    pub iss: Issuer,

    /// The user the session belongs to
    pub sub: Subject,

    /// The purchasing organization
    #[serde(rename = "orgId")]
    pub org_id: OrgId,

    /// The application the session grants access to
    #[serde(rename = "appId")]
    pub app_id: AppId,

    /// The logical session identifier
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,

    /// When the credential was issued
    pub iat: UnixTime,

    /// When the session expires
    pub exp: UnixTime,

    /// The nominal purchased duration, in minutes
    #[serde(rename = "durationMinutes")]
    pub duration_minutes: u64,

    /// The user's email, when the issuer shares it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A decomposed session credential, ready for key resolution
///
/// The header may be inspected to elect the verification key, but nothing
/// in it is trustworthy until [`verify`][Decomposed::verify] succeeds.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct Decomposed<'a> {
    header: Header,
    message: &'a str,
    payload: &'a str,
    signature: Vec<u8>,
}

macro_rules! expect_two {
    ($iter:expr) => {{
        let mut i = $iter;
        match (i.next(), i.next(), i.next()) {
            (Some(first), Some(second), None) => Some((first, second)),
            _ => None,
        }
    }};
}

impl SessionTokenRef {
    /// Decomposes the credential into its parts, preparing it for
    /// verification
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::MalformedCredential`][error::CredentialError::MalformedCredential]
    /// if the credential does not have three base64url parts or the header
    /// does not name an accepted algorithm.
    pub fn decompose(&self) -> Result<Decomposed, error::CredentialError> {
        let (s_str, message) = expect_two!(self.as_str().rsplitn(2, '.'))
            .ok_or_else(error::malformed_opaque)?;
        let (p_str, h_str) =
            expect_two!(message.rsplitn(2, '.')).ok_or_else(error::malformed_opaque)?;

        let h_raw = b64::decode(h_str).map_err(error::malformed)?;
        let signature = b64::decode(s_str).map_err(error::malformed)?;
        let header: Header = serde_json::from_slice(&h_raw).map_err(error::malformed)?;

        Ok(Decomposed {
            header,
            message,
            payload: p_str,
            signature,
        })
    }
}

impl<'a> Decomposed<'a> {
    /// The declared signing algorithm
    pub fn alg(&self) -> jwa::Algorithm {
        self.header.alg
    }

    /// The declared signing key ID
    pub fn kid(&self) -> Option<&jwk::KeyIdRef> {
        self.header.kid.as_deref()
    }

    /// Verifies the signature with the given key and validates the claims
    ///
    /// # Errors
    ///
    /// Returns an error if the signature does not verify, the payload is
    /// not a well-formed claims document, or the claims fail validation.
    pub fn verify<C: Clock>(
        self,
        key: &Jwk,
        validator: &CredentialValidator,
        clock: &C,
    ) -> Result<ValidatedSession, error::CredentialError> {
        key.verify(self.header.alg, self.message.as_bytes(), &self.signature)?;

        let p_raw = b64::decode(self.payload).map_err(error::malformed)?;
        let claims: Claims = serde_json::from_slice(&p_raw).map_err(error::malformed)?;

        validator.validate_claims(&claims, clock)?;

        Ok(ValidatedSession { claims })
    }
}

/// The validation plan applied to a credential's claims
///
/// The expected issuer is always enforced; the expected application is
/// enforced only when the host supplies one.
#[derive(Clone, Debug)]
#[must_use]
pub struct CredentialValidator {
    issuer: Issuer,
    expected_app: Option<AppId>,
    leeway: DurationSecs,
}

impl CredentialValidator {
    /// The default clock-skew allowance applied to time-based claims
    pub const DEFAULT_LEEWAY: DurationSecs = DurationSecs(60);

    /// Constructs a validator requiring the given issuer
    pub fn new(issuer: Issuer) -> Self {
        Self {
            issuer,
            expected_app: None,
            leeway: Self::DEFAULT_LEEWAY,
        }
    }

    /// Requires that the credential's application claim match exactly
    pub fn with_expected_application(self, app: AppId) -> Self {
        Self {
            expected_app: Some(app),
            ..self
        }
    }

    /// Overrides the clock-skew allowance
    pub fn with_leeway(self, leeway: DurationSecs) -> Self {
        Self { leeway, ..self }
    }

    /// Validates the claims against this plan as of the clock's current time
    ///
    /// # Errors
    ///
    /// Each check fails independently: [`Expired`][error::CredentialError::Expired],
    /// [`IssuerMismatch`][error::CredentialError::IssuerMismatch], or
    /// [`ApplicationMismatch`][error::CredentialError::ApplicationMismatch].
    pub fn validate_claims<C: Clock>(
        &self,
        claims: &Claims,
        clock: &C,
    ) -> Result<(), error::CredentialError> {
        let now = clock.now();

        if claims.exp.0 < now.0.saturating_sub(self.leeway.0) {
            return Err(error::CredentialError::Expired);
        }

        // A credential from the future beyond any plausible skew is not a
        // timing problem, it is a fabrication.
        if claims.iat.0 > now.0 + self.leeway.0 {
            return Err(error::malformed_opaque());
        }

        if claims.iss != self.issuer {
            return Err(error::CredentialError::IssuerMismatch);
        }

        if let Some(expected) = &self.expected_app {
            if claims.app_id != *expected {
                return Err(error::CredentialError::ApplicationMismatch);
            }
        }

        Ok(())
    }
}

/// A session credential whose signature and claims have been validated
///
/// This type can only be produced by this crate, asserting that the claims
/// it holds came from a verified credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedSession {
    claims: Claims,
}

impl ValidatedSession {
    /// The validated claims
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// The logical session identifier
    pub fn session_id(&self) -> &SessionIdRef {
        &self.claims.session_id
    }

    /// The session time left as of `now`, floored to whole seconds
    ///
    /// Returns zero when the expiration has already passed.
    pub fn remaining_at(&self, now: UnixTime) -> DurationSecs {
        self.claims.exp - now
    }
}

#[cfg(test)]
mod tests {
    use wicket_clock::TestClock;

    use super::*;

    fn claims(exp: u64) -> Claims {
        Claims {
            iss: Issuer::from_static("https://market.example.com"),
            sub: Subject::from_static("user-77"),
            org_id: OrgId::from_static("org-9"),
            app_id: AppId::from_static("app-12"),
            session_id: SessionId::from_static("sess-345"),
            iat: UnixTime(1_000),
            exp: UnixTime(exp),
            duration_minutes: 60,
            email: None,
        }
    }

    fn validator() -> CredentialValidator {
        CredentialValidator::new(Issuer::from_static("https://market.example.com"))
    }

    #[test]
    fn accepts_valid_claims() {
        let clock = TestClock::new(UnixTime(2_000));
        validator().validate_claims(&claims(4_600), &clock).unwrap();
    }

    #[test]
    fn rejects_expired_claims() {
        let clock = TestClock::new(UnixTime(5_000));
        let err = validator().validate_claims(&claims(4_600), &clock).unwrap_err();
        assert!(matches!(err, error::CredentialError::Expired));
    }

    #[test]
    fn leeway_tolerates_skew_on_expiration() {
        // 45 seconds past exp is within the default 60-second leeway
        let clock = TestClock::new(UnixTime(4_645));
        validator().validate_claims(&claims(4_600), &clock).unwrap();
    }

    #[test]
    fn rejects_issuer_mismatch() {
        let clock = TestClock::new(UnixTime(2_000));
        let v = CredentialValidator::new(Issuer::from_static("https://other.example.com"));
        let err = v.validate_claims(&claims(4_600), &clock).unwrap_err();
        assert!(matches!(err, error::CredentialError::IssuerMismatch));
    }

    #[test]
    fn rejects_application_mismatch() {
        let clock = TestClock::new(UnixTime(2_000));
        let v = validator().with_expected_application(AppId::from_static("app-99"));
        let err = v.validate_claims(&claims(4_600), &clock).unwrap_err();
        assert!(matches!(err, error::CredentialError::ApplicationMismatch));
    }

    #[test]
    fn application_not_checked_when_not_supplied() {
        let clock = TestClock::new(UnixTime(2_000));
        validator().validate_claims(&claims(4_600), &clock).unwrap();
    }

    #[test]
    fn rejects_claims_issued_in_the_future() {
        let clock = TestClock::new(UnixTime(500));
        let err = validator().validate_claims(&claims(4_600), &clock).unwrap_err();
        assert!(matches!(
            err,
            error::CredentialError::MalformedCredential(_)
        ));
    }

    #[test]
    fn decompose_rejects_two_part_tokens() {
        let token = SessionTokenRef::from_str("eyJhbGciOiJSUzI1NiJ9.eyJzdWIiOiJ4In0");
        assert!(matches!(
            token.decompose().unwrap_err(),
            error::CredentialError::MalformedCredential(_)
        ));
    }

    #[test]
    fn decompose_rejects_unsigned_algorithm() {
        // header: {"alg":"none"}
        let header = b64::encode(br#"{"alg":"none"}"#);
        let raw = format!("{header}.e30.c2ln");
        let token = SessionToken::new(raw);
        assert!(matches!(
            token.decompose().unwrap_err(),
            error::CredentialError::MalformedCredential(_)
        ));
    }

    #[test]
    fn remaining_time_floors_at_zero() {
        let session = ValidatedSession {
            claims: claims(4_600),
        };
        assert_eq!(session.remaining_at(UnixTime(1_600)), DurationSecs(3_000));
        assert_eq!(session.remaining_at(UnixTime(9_999)), DurationSecs(0));
    }
}
