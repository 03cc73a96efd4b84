//! Credential validation backed by the issuer's published key set
//!
//! The key set is fetched lazily, cached with a TTL, and refetched at
//! most once per validation when a credential references a key the cache
//! does not hold. Concurrent refreshes collapse into a single fetch.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use reqwest::{
    header::{self, HeaderValue},
    Client, StatusCode,
};
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;
use wicket::{
    credential::CredentialValidator, error::CredentialError, Jwks, SessionTokenRef,
    ValidatedSession,
};
use wicket_clock::{Clock, DurationSecs, UnixTime};

use crate::error::ApiError;

/// An error validating a credential against the issuer's keys
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// The credential itself was rejected
    #[error("session credential rejected")]
    Credential(#[from] CredentialError),

    /// The issuer's key set could not be obtained
    #[error("could not obtain the issuer's key set")]
    KeySetFetch(#[source] ApiError),
}

/// What a key set fetch produced
#[derive(Debug)]
pub enum KeySetUpdate {
    /// A new key set
    Fresh(Jwks),
    /// The source confirmed the held key set is still current
    Unchanged,
}

/// An asynchronous source of the issuer's key set
#[async_trait]
pub trait KeySetSource: Send + Sync {
    /// Fetches the key set, or confirms the held one is still current
    async fn fetch(&self) -> Result<KeySetUpdate, ApiError>;
}

#[async_trait]
impl<T> KeySetSource for Arc<T>
where
    T: KeySetSource + ?Sized,
{
    async fn fetch(&self) -> Result<KeySetUpdate, ApiError> {
        (**self).fetch().await
    }
}

#[derive(Debug, Default)]
struct ConditionalState {
    etag: Option<HeaderValue>,
    last_modified: Option<HeaderValue>,
}

/// A [`KeySetSource`] that fetches the key set over HTTP
///
/// Validators from the previous response are replayed so an unchanged
/// key set costs a 304 rather than a full body.
#[derive(Debug)]
pub struct HttpKeySetSource {
    client: Client,
    url: Url,
    conditional: std::sync::Mutex<ConditionalState>,
}

impl HttpKeySetSource {
    /// Constructs a source against the key set URL
    pub fn new(client: Client, url: Url) -> Self {
        Self {
            client,
            url,
            conditional: std::sync::Mutex::new(ConditionalState::default()),
        }
    }
}

#[async_trait]
impl KeySetSource for HttpKeySetSource {
    #[tracing::instrument(skip(self), fields(keys.url = %self.url))]
    async fn fetch(&self) -> Result<KeySetUpdate, ApiError> {
        let mut request = self.client.get(self.url.clone());

        {
            let state = self.conditional.lock().unwrap();
            if let Some(etag) = &state.etag {
                request = request.header(header::IF_NONE_MATCH, etag);
            } else if let Some(last_modified) = &state.last_modified {
                request = request.header(header::IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request.send().await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            tracing::debug!("key set not modified");
            return Ok(KeySetUpdate::Unchanged);
        }

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                http.status_code = status.as_u16(),
                "key set fetch failed; unexpected response status"
            );
            return Err(ApiError::Status {
                status: status.as_u16(),
            });
        }

        let etag = response.headers().get(header::ETAG).map(ToOwned::to_owned);
        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .map(ToOwned::to_owned);

        let jwks = response
            .json::<Jwks>()
            .await
            .map_err(|err| ApiError::body(err))?;

        {
            let mut state = self.conditional.lock().unwrap();
            state.etag = etag;
            state.last_modified = last_modified;
        }

        tracing::info!("key set refreshed");
        Ok(KeySetUpdate::Fresh(jwks))
    }
}

#[derive(Debug)]
struct CachedKeys {
    jwks: Jwks,
    fetched_at: UnixTime,
}

struct Inner<S> {
    data: ArcSwapOption<CachedKeys>,
    source: S,
    validator: CredentialValidator,
    ttl: DurationSecs,
    refresh: Mutex<()>,
}

/// An authority that validates session credentials against a cached,
/// remotely sourced key set
#[derive(Clone)]
#[must_use]
pub struct KeyAuthority<S> {
    inner: Arc<Inner<S>>,
}

impl<S> std::fmt::Debug for KeyAuthority<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyAuthority")
            .field("ttl", &self.inner.ttl)
            .finish_non_exhaustive()
    }
}

impl<S: KeySetSource> KeyAuthority<S> {
    /// Constructs an authority over the given source and validation plan
    pub fn new(source: S, validator: CredentialValidator, ttl: DurationSecs) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: ArcSwapOption::const_empty(),
                source,
                validator,
                ttl,
                refresh: Mutex::new(()),
            }),
        }
    }

    /// Seeds the cache with an already-held key set
    pub fn set_keys(&self, jwks: Jwks, now: UnixTime) {
        self.inner.data.store(Some(Arc::new(CachedKeys {
            jwks,
            fetched_at: now,
        })));
    }

    fn is_fresh(&self, now: UnixTime) -> bool {
        self.inner
            .data
            .load()
            .as_ref()
            .map_or(false, |c| now - c.fetched_at < self.inner.ttl)
    }

    /// Fetches the key set if another task has not done so already
    async fn refresh(&self, now: UnixTime, force: bool) -> Result<(), AuthorityError> {
        let _guard = self.inner.refresh.lock().await;

        // Another task may have refreshed while we waited on the lock
        if !force && self.is_fresh(now) {
            return Ok(());
        }

        match self
            .inner
            .source
            .fetch()
            .await
            .map_err(AuthorityError::KeySetFetch)?
        {
            KeySetUpdate::Fresh(jwks) => {
                self.inner.data.store(Some(Arc::new(CachedKeys {
                    jwks,
                    fetched_at: now,
                })));
            }
            KeySetUpdate::Unchanged => {
                if let Some(cached) = self.inner.data.load_full() {
                    self.inner.data.store(Some(Arc::new(CachedKeys {
                        jwks: cached.jwks.clone(),
                        fetched_at: now,
                    })));
                }
            }
        }

        Ok(())
    }

    /// Validates a session credential, fetching keys as needed
    ///
    /// A credential referencing a key the cache does not hold triggers one
    /// refetch before the credential is rejected, covering issuer key
    /// rotation.
    ///
    /// # Errors
    ///
    /// Returns an error if the key set cannot be obtained or the
    /// credential fails verification.
    pub async fn validate<C: Clock>(
        &self,
        token: &SessionTokenRef,
        clock: &C,
    ) -> Result<ValidatedSession, AuthorityError> {
        let now = clock.now();
        let decomposed = token.decompose()?;

        if !self.is_fresh(now) {
            self.refresh(now, false).await?;
        }

        let has_key = {
            let guard = self.inner.data.load();
            guard
                .as_ref()
                .and_then(|c| c.jwks.get_key_by_opt(decomposed.kid(), decomposed.alg()))
                .is_some()
        };

        if !has_key {
            tracing::debug!(alg = %decomposed.alg(), "no matching key held; refetching key set");
            self.refresh(now, true).await?;
        }

        let guard = self.inner.data.load();
        let key = guard
            .as_ref()
            .and_then(|c| c.jwks.get_key_by_opt(decomposed.kid(), decomposed.alg()))
            .ok_or(CredentialError::UnknownSigningKey)?;

        let validated = decomposed.verify(key, &self.inner.validator, clock)?;
        Ok(validated)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use wicket_clock::TestClock;

    use super::*;

    struct CountingSource {
        jwks: Jwks,
        fetches: AtomicUsize,
    }

    impl CountingSource {
        fn new(jwks: Jwks) -> Self {
            Self {
                jwks,
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl KeySetSource for CountingSource {
        async fn fetch(&self) -> Result<KeySetUpdate, ApiError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(KeySetUpdate::Fresh(self.jwks.clone()))
        }
    }

    fn authority(source: Arc<CountingSource>) -> KeyAuthority<Arc<CountingSource>> {
        let validator =
            CredentialValidator::new(wicket::Issuer::from_static("https://issuer.example.com"));
        KeyAuthority::new(source, validator, DurationSecs(3600))
    }

    fn token_of(header: &str, payload: &str) -> wicket::SessionToken {
        wicket::SessionToken::new(format!(
            "{}.{}.{}",
            wicket::b64::encode(header.as_bytes()),
            wicket::b64::encode(payload.as_bytes()),
            wicket::b64::encode(b"sig"),
        ))
    }

    #[tokio::test]
    async fn malformed_token_is_rejected_without_fetching() {
        let source = Arc::new(CountingSource::new(Jwks::default()));
        let auth = authority(Arc::clone(&source));
        let clock = TestClock::new(UnixTime(1_000));

        let err = auth
            .validate(SessionTokenRef::from_str("not-a-token"), &clock)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthorityError::Credential(CredentialError::MalformedCredential(_))
        ));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_key_triggers_exactly_one_refetch() {
        let source = Arc::new(CountingSource::new(Jwks::default()));
        let auth = authority(Arc::clone(&source));
        let clock = TestClock::new(UnixTime(1_000));

        // Well-formed but referencing a key no source will ever supply
        let token = token_of(r#"{"alg":"ES256","kid":"nope"}"#, "{}");

        let err = auth.validate(&token, &clock).await.unwrap_err();
        assert!(matches!(
            err,
            AuthorityError::Credential(CredentialError::UnknownSigningKey)
        ));
        // One TTL fetch, one forced refetch for the unknown kid
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fresh_cache_is_not_refetched() {
        let source = Arc::new(CountingSource::new(Jwks::default()));
        let auth = authority(Arc::clone(&source));
        let clock = TestClock::new(UnixTime(1_000));
        auth.set_keys(Jwks::default(), clock.now());

        let token = token_of(r#"{"alg":"ES256","kid":"nope"}"#, "{}");

        let _ = auth.validate(&token, &clock).await.unwrap_err();
        // Only the forced unknown-kid refetch; the TTL check passed
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }
}
