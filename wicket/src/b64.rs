//! URL-safe base64 handling for JOSE segments

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const ENGINE: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Decodes a base64url (no padding) segment
pub fn decode(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    ENGINE.decode(encoded)
}

/// Encodes bytes as base64url without padding
pub fn encode(raw: &[u8]) -> String {
    ENGINE.encode(raw)
}

/// A byte buffer that serializes as base64url without padding
///
/// Used for the binary parameters of JSON Web Keys (RSA modulus and
/// exponent, elliptic curve coordinates).
#[derive(Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Base64Url(Vec<u8>);

impl Base64Url {
    /// Wraps the raw bytes
    #[inline]
    pub fn from_raw(raw: impl Into<Vec<u8>>) -> Self {
        Self(raw.into())
    }

    /// Decodes from the encoded representation
    pub fn from_encoded(encoded: &str) -> Result<Self, base64::DecodeError> {
        Ok(Self(decode(encoded)?))
    }

    /// A view of the underlying bytes
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Base64Url {
    #[inline]
    fn from(raw: Vec<u8>) -> Self {
        Self(raw)
    }
}

impl From<&[u8]> for Base64Url {
    #[inline]
    fn from(raw: &[u8]) -> Self {
        Self(raw.to_vec())
    }
}

impl std::fmt::Debug for Base64Url {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&encode(&self.0))
    }
}

impl Serialize for Base64Url {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Base64Url {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_encoded(&encoded).map_err(serde::de::Error::custom)
    }
}
