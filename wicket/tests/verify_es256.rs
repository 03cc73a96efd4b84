//! End-to-end verification of freshly signed ES256 credentials

use wicket_clock::Clock;
use ring::{
    rand::SystemRandom,
    signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING},
};
use wicket::{
    b64,
    credential::{AppId, CredentialValidator, Issuer, SessionToken},
    error::CredentialError,
    jwk::{Curve, EllipticCurve, KeyId},
    Jwk, Jwks,
};
use wicket_clock::{DurationSecs, TestClock, UnixTime};

const ISSUER: &str = "https://market.example.com";
const KID: &str = "integration-key";

struct SigningFixture {
    key_pair: EcdsaKeyPair,
    rng: SystemRandom,
    jwks: Jwks,
}

impl SigningFixture {
    fn new() -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .expect("keygen");
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .expect("keypair");

        let public = EllipticCurve::from_uncompressed_point(
            Curve::P256,
            key_pair.public_key().as_ref(),
        )
        .expect("public point");

        let mut jwks = Jwks::default();
        jwks.add_key(
            Jwk::from(public)
                .with_key_id(KeyId::new(KID.to_string()))
                .with_algorithm(wicket::jwa::Algorithm::ES256),
        );

        Self {
            key_pair,
            rng,
            jwks,
        }
    }

    fn sign(&self, kid: &str, claims_json: &str) -> SessionToken {
        let header = b64::encode(format!(r#"{{"alg":"ES256","kid":"{kid}"}}"#).as_bytes());
        let payload = b64::encode(claims_json.as_bytes());
        let message = format!("{header}.{payload}");
        let signature = self
            .key_pair
            .sign(&self.rng, message.as_bytes())
            .expect("sign");
        SessionToken::new(format!("{message}.{}", b64::encode(signature.as_ref())))
    }
}

fn claims_json(exp: u64) -> String {
    format!(
        r#"{{
            "iss": "{ISSUER}",
            "sub": "user-42",
            "orgId": "org-7",
            "appId": "app-3",
            "sessionId": "sess-100",
            "iat": 1000,
            "exp": {exp},
            "durationMinutes": 60,
            "email": "user@example.com"
        }}"#
    )
}

fn validator() -> CredentialValidator {
    CredentialValidator::new(Issuer::from_static(ISSUER))
}

#[test]
fn verifies_a_freshly_signed_credential() {
    let fixture = SigningFixture::new();
    let token = fixture.sign(KID, &claims_json(4_600));
    let clock = TestClock::new(UnixTime(2_000));

    let decomposed = token.decompose().expect("decompose");
    let key = fixture
        .jwks
        .get_key_by_id(decomposed.kid().expect("kid"), decomposed.alg())
        .expect("key lookup");

    let session = decomposed
        .verify(key, &validator(), &clock)
        .expect("verification");

    assert_eq!(session.session_id().as_str(), "sess-100");
    assert_eq!(session.claims().duration_minutes, 60);
    // remaining equals exp - now
    assert_eq!(session.remaining_at(clock.now()), DurationSecs(2_600));
}

#[test]
fn rejects_a_tampered_payload() {
    let fixture = SigningFixture::new();
    let token = fixture.sign(KID, &claims_json(4_600));

    // Swap in a payload claiming a much later expiry, keeping the signature
    let parts: Vec<&str> = token.as_str().split('.').collect();
    let forged_payload = b64::encode(claims_json(9_999_999).as_bytes());
    let forged = SessionToken::new(format!("{}.{}.{}", parts[0], forged_payload, parts[2]));

    let clock = TestClock::new(UnixTime(2_000));
    let decomposed = forged.decompose().expect("decompose");
    let key = fixture
        .jwks
        .get_key_by_id(decomposed.kid().expect("kid"), decomposed.alg())
        .expect("key lookup");

    let err = decomposed.verify(key, &validator(), &clock).unwrap_err();
    assert!(matches!(err, CredentialError::InvalidSignature));
}

#[test]
fn rejects_an_expired_credential_after_signature_check() {
    let fixture = SigningFixture::new();
    let token = fixture.sign(KID, &claims_json(4_600));

    // Well past exp plus the default leeway
    let clock = TestClock::new(UnixTime(10_000));
    let decomposed = token.decompose().expect("decompose");
    let key = fixture
        .jwks
        .get_key_by_id(decomposed.kid().expect("kid"), decomposed.alg())
        .expect("key lookup");

    let err = decomposed.verify(key, &validator(), &clock).unwrap_err();
    assert!(matches!(err, CredentialError::Expired));
}

#[test]
fn unknown_kid_finds_no_key() {
    let fixture = SigningFixture::new();
    let token = fixture.sign("some-other-key", &claims_json(4_600));

    let decomposed = token.decompose().expect("decompose");
    assert!(fixture
        .jwks
        .get_key_by_id(decomposed.kid().expect("kid"), decomposed.alg())
        .is_none());
}

#[test]
fn application_mismatch_is_reported_for_signed_credentials() {
    let fixture = SigningFixture::new();
    let token = fixture.sign(KID, &claims_json(4_600));
    let clock = TestClock::new(UnixTime(2_000));

    let decomposed = token.decompose().expect("decompose");
    let key = fixture
        .jwks
        .get_key_by_id(decomposed.kid().expect("kid"), decomposed.alg())
        .expect("key lookup");

    let err = decomposed
        .verify(
            key,
            &validator().with_expected_application(AppId::from_static("app-other")),
            &clock,
        )
        .unwrap_err();
    assert!(matches!(err, CredentialError::ApplicationMismatch));
}
