//! The issuer's published key set

use serde::{de::Deserializer, Deserialize, Serialize};

use crate::{jwa, jwk, Jwk};

/// A set of public signing keys (JWKS)
///
/// Keys the crate cannot use (unsupported key types, malformed entries)
/// are dropped during deserialization rather than failing the whole set,
/// since issuers may publish keys for purposes beyond credential signing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    #[serde(deserialize_with = "deserialize_keys")]
    keys: Vec<Jwk>,
}

impl Jwks {
    /// Adds a key to the set
    pub fn add_key(&mut self, key: Jwk) {
        self.keys.push(key);
    }

    /// A view of the keys in this set
    pub fn keys(&self) -> &[Jwk] {
        &self.keys
    }

    /// Gets a key that can verify signatures made with the given
    /// algorithm, matching on the key ID when one is present
    pub fn get_key_by_opt(
        &self,
        kid: Option<&'_ jwk::KeyIdRef>,
        alg: jwa::Algorithm,
    ) -> Option<&Jwk> {
        match kid {
            Some(kid) => self.get_key_by_id(kid, alg),
            None => self
                .keys
                .iter()
                .find(|k| {
                    k.is_compatible(alg)
                        && k.usage() != Some(jwk::Usage::Encryption)
                        && k.algorithm().map_or(true, |a| a == alg)
                }),
        }
    }

    /// Gets the key matching the given key ID that can verify signatures
    /// made with the given algorithm
    ///
    /// A key without any ID is used only if no key carries a matching ID.
    pub fn get_key_by_id(
        &self,
        kid: &'_ jwk::KeyIdRef,
        alg: jwa::Algorithm,
    ) -> Option<&Jwk> {
        let usable = |k: &&Jwk| {
            k.is_compatible(alg)
                && k.usage() != Some(jwk::Usage::Encryption)
                && k.algorithm().map_or(true, |a| a == alg)
        };

        self.keys
            .iter()
            .filter(usable)
            .find(|k| k.key_id() == Some(kid))
            .or_else(|| {
                self.keys
                    .iter()
                    .filter(usable)
                    .find(|k| k.key_id().is_none())
            })
    }
}

fn deserialize_keys<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Jwk>, D::Error> {
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwk::KeyIdRef;

    const MIXED_JWKS: &str = r#"{
        "keys": [
            {
                "kty": "RSA",
                "kid": "rsa-1",
                "use": "sig",
                "alg": "RS256",
                "n": "AQAB",
                "e": "AQAB"
            },
            {
                "kty": "EC",
                "kid": "ec-1",
                "crv": "P-256",
                "x": "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4",
                "y": "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM"
            },
            {
                "kty": "oct",
                "kid": "sym-1",
                "k": "c2VjcmV0"
            }
        ]
    }"#;

    #[test]
    fn unusable_keys_are_dropped() {
        let jwks: Jwks = serde_json::from_str(MIXED_JWKS).unwrap();
        assert_eq!(jwks.keys().len(), 2);
    }

    #[test]
    fn lookup_respects_kid_and_algorithm() {
        let jwks: Jwks = serde_json::from_str(MIXED_JWKS).unwrap();

        let rsa = jwks
            .get_key_by_id(KeyIdRef::from_str("rsa-1"), jwa::Algorithm::RS256)
            .unwrap();
        assert_eq!(rsa.key_id().unwrap(), KeyIdRef::from_str("rsa-1"));

        // The RSA key pins alg RS256, so an RS384 request must not match it
        assert!(jwks
            .get_key_by_id(KeyIdRef::from_str("rsa-1"), jwa::Algorithm::RS384)
            .is_none());

        assert!(jwks
            .get_key_by_id(KeyIdRef::from_str("ec-1"), jwa::Algorithm::ES256)
            .is_some());

        assert!(jwks
            .get_key_by_id(KeyIdRef::from_str("missing"), jwa::Algorithm::ES256)
            .is_none());
    }
}
