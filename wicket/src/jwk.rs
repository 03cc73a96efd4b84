//! Public signing keys, as delivered by the issuer's JWKS endpoint
//!
//! Only the verification-relevant subset of the JSON Web Key standard is
//! modeled: RSA and elliptic curve public keys. Private key material is
//! never handled by this crate.

use aliri_braid::braid;
use serde::{Deserialize, Serialize};

use crate::{b64::Base64Url, error, jwa};

/// An identifier for a signing key
#[braid(serde, ref_doc = "A borrowed reference to a key identifier ([`KeyId`])")]
pub struct KeyId;

/// The intended usage of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Usage {
    /// The key is used for signing
    #[serde(rename = "sig")]
    Signing,
    /// The key is used for encryption
    #[serde(rename = "enc")]
    Encryption,
}

/// An identified public signing key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct Jwk {
    #[serde(rename = "kid", default, skip_serializing_if = "Option::is_none")]
    key_id: Option<KeyId>,

    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,

    #[serde(rename = "alg", default, skip_serializing_if = "Option::is_none")]
    algorithm: Option<jwa::Algorithm>,

    #[serde(flatten)]
    key: Key,
}

impl Jwk {
    /// The key ID
    #[must_use]
    pub fn key_id(&self) -> Option<&KeyIdRef> {
        self.key_id.as_deref()
    }

    /// The intended usage of the key
    #[must_use]
    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// The algorithm to be used with this key
    #[must_use]
    pub fn algorithm(&self) -> Option<jwa::Algorithm> {
        self.algorithm
    }

    /// Whether the key can verify signatures made with the given algorithm
    #[must_use]
    pub fn is_compatible(&self, alg: jwa::Algorithm) -> bool {
        self.key.is_compatible(alg)
    }

    /// Sets the key ID
    pub fn with_key_id(self, kid: KeyId) -> Self {
        Self {
            key_id: Some(kid),
            ..self
        }
    }

    /// Sets the algorithm and signing usage
    pub fn with_algorithm(self, alg: jwa::Algorithm) -> Self {
        Self {
            algorithm: Some(alg),
            usage: Some(Usage::Signing),
            ..self
        }
    }

    /// Verifies a signature over `data` using this key and the given algorithm
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidSignature`] if the signature does
    /// not verify or the key is incompatible with the algorithm.
    pub fn verify(
        &self,
        alg: jwa::Algorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), error::CredentialError> {
        self.key.verify(alg, data, signature)
    }
}

impl From<Rsa> for Jwk {
    fn from(key: Rsa) -> Self {
        Self {
            key_id: None,
            usage: None,
            algorithm: None,
            key: Key::Rsa(key),
        }
    }
}

impl From<EllipticCurve> for Jwk {
    fn from(key: EllipticCurve) -> Self {
        Self {
            key_id: None,
            usage: None,
            algorithm: None,
            key: Key::EllipticCurve(key),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
enum Key {
    #[serde(rename = "RSA")]
    Rsa(Rsa),
    #[serde(rename = "EC")]
    EllipticCurve(EllipticCurve),
}

impl Key {
    fn is_compatible(&self, alg: jwa::Algorithm) -> bool {
        match self {
            Self::Rsa(_) => alg.rsa_verification_params().is_some(),
            Self::EllipticCurve(k) => k.is_compatible(alg),
        }
    }

    fn verify(
        &self,
        alg: jwa::Algorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), error::CredentialError> {
        match self {
            Self::Rsa(k) => k.verify(alg, data, signature),
            Self::EllipticCurve(k) => k.verify(alg, data, signature),
        }
    }
}

/// RSA public key components
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct Rsa {
    /// The public modulus
    #[serde(rename = "n")]
    modulus: Base64Url,

    /// The public exponent
    #[serde(rename = "e")]
    exponent: Base64Url,
}

impl Rsa {
    /// Constructs a public key from the modulus and exponent
    pub fn from_components(
        modulus: impl Into<Base64Url>,
        exponent: impl Into<Base64Url>,
    ) -> Self {
        Self {
            modulus: modulus.into(),
            exponent: exponent.into(),
        }
    }

    fn verify(
        &self,
        alg: jwa::Algorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), error::CredentialError> {
        let params = alg
            .rsa_verification_params()
            .ok_or(error::CredentialError::InvalidSignature)?;

        let pk = ring::signature::RsaPublicKeyComponents {
            n: self.modulus.as_slice(),
            e: self.exponent.as_slice(),
        };

        pk.verify(params, data, signature)
            .map_err(|_| error::CredentialError::InvalidSignature)
    }
}

/// The elliptic curves accepted for credential signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Curve {
    /// The NIST P-256 curve
    #[serde(rename = "P-256")]
    P256,
    /// The NIST P-384 curve
    #[serde(rename = "P-384")]
    P384,
}

impl Curve {
    fn coordinate_len(self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
        }
    }

    fn supports(self, alg: jwa::Algorithm) -> bool {
        matches!(
            (self, alg),
            (Self::P256, jwa::Algorithm::ES256) | (Self::P384, jwa::Algorithm::ES384)
        )
    }
}

/// Elliptic curve public key components
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct EllipticCurve {
    /// The key's curve
    #[serde(rename = "crv")]
    curve: Curve,

    /// The x-coordinate of the public point
    #[serde(rename = "x")]
    x: Base64Url,

    /// The y-coordinate of the public point
    #[serde(rename = "y")]
    y: Base64Url,
}

impl EllipticCurve {
    /// Constructs a public key from its curve and point coordinates
    pub fn from_components(
        curve: Curve,
        x: impl Into<Base64Url>,
        y: impl Into<Base64Url>,
    ) -> Self {
        Self {
            curve,
            x: x.into(),
            y: y.into(),
        }
    }

    /// Constructs a public key from an uncompressed SEC1 point (`04 || x || y`)
    ///
    /// # Errors
    ///
    /// Returns an error if the point does not have the uncompressed form
    /// expected for the given curve.
    pub fn from_uncompressed_point(
        curve: Curve,
        point: &[u8],
    ) -> Result<Self, error::KeyRejected> {
        let coord = curve.coordinate_len();
        if point.len() != 1 + coord * 2 || point[0] != 0x04 {
            return Err(error::key_rejected("not an uncompressed SEC1 point"));
        }
        Ok(Self {
            curve,
            x: Base64Url::from_raw(&point[1..1 + coord]),
            y: Base64Url::from_raw(&point[1 + coord..]),
        })
    }

    fn is_compatible(&self, alg: jwa::Algorithm) -> bool {
        self.curve.supports(alg)
    }

    // Coordinates are left-padded in case an encoder stripped leading zeros.
    fn uncompressed_point(&self) -> Vec<u8> {
        let coord = self.curve.coordinate_len();
        let mut point = Vec::with_capacity(1 + coord * 2);
        point.push(0x04);
        for part in [self.x.as_slice(), self.y.as_slice()] {
            point.resize(point.len() + coord.saturating_sub(part.len()), 0);
            point.extend_from_slice(&part[part.len().saturating_sub(coord)..]);
        }
        point
    }

    fn verify(
        &self,
        alg: jwa::Algorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), error::CredentialError> {
        if !self.curve.supports(alg) {
            return Err(error::CredentialError::InvalidSignature);
        }
        let params = alg
            .ec_verification_params()
            .ok_or(error::CredentialError::InvalidSignature)?;

        let point = self.uncompressed_point();
        ring::signature::UnparsedPublicKey::new(params, &point)
            .verify(data, signature)
            .map_err(|_| error::CredentialError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSA_JWK: &str = r#"{
        "kty": "RSA",
        "kid": "key-1",
        "use": "sig",
        "alg": "RS256",
        "n": "AQAB",
        "e": "AQAB"
    }"#;

    const EC_JWK: &str = r#"{
        "kty": "EC",
        "kid": "key-2",
        "crv": "P-256",
        "x": "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4",
        "y": "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM"
    }"#;

    #[test]
    fn deserializes_rsa_jwk() {
        let jwk: Jwk = serde_json::from_str(RSA_JWK).unwrap();
        assert_eq!(jwk.key_id().unwrap(), KeyIdRef::from_str("key-1"));
        assert_eq!(jwk.usage(), Some(Usage::Signing));
        assert_eq!(jwk.algorithm(), Some(jwa::Algorithm::RS256));
        assert!(jwk.is_compatible(jwa::Algorithm::RS512));
        assert!(!jwk.is_compatible(jwa::Algorithm::ES256));
    }

    #[test]
    fn deserializes_ec_jwk() {
        let jwk: Jwk = serde_json::from_str(EC_JWK).unwrap();
        assert!(jwk.is_compatible(jwa::Algorithm::ES256));
        assert!(!jwk.is_compatible(jwa::Algorithm::ES384));
        assert!(!jwk.is_compatible(jwa::Algorithm::RS256));
    }

    #[test]
    fn rejects_unsupported_key_type() {
        let oct = r#"{"kty":"oct","k":"c2VjcmV0"}"#;
        assert!(serde_json::from_str::<Jwk>(oct).is_err());
    }
}
