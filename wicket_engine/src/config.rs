//! Engine configuration

use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;
use url::Url;
use wicket::{AppId, Issuer, SessionToken};
use wicket_clock::DurationSecs;

/// The query parameter a session credential arrives under
pub const DEFAULT_TOKEN_PARAM: &str = "gwSession";

/// How the engine runs a session
///
/// Constructed with [`EngineConfig::new`] and refined with the builder
/// methods; every knob has a default suitable for production.
#[derive(Clone, Debug)]
#[must_use]
pub struct EngineConfig {
    pub(crate) issuer: Issuer,
    pub(crate) expected_app: Option<AppId>,
    pub(crate) token_param: String,
    pub(crate) warning_threshold: DurationSecs,
    pub(crate) leeway: DurationSecs,
    pub(crate) key_ttl: DurationSecs,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) max_heartbeat_failures: u32,
    pub(crate) hook_timeout: Duration,
    pub(crate) coordinator_heartbeat: Duration,
    pub(crate) claim_delay: RangeInclusive<u64>,
    pub(crate) relay_timeout: Duration,
}

impl EngineConfig {
    /// Constructs a configuration trusting credentials from the given
    /// issuer
    pub fn new(issuer: Issuer) -> Self {
        Self {
            issuer,
            expected_app: None,
            token_param: DEFAULT_TOKEN_PARAM.to_owned(),
            warning_threshold: DurationSecs(300),
            leeway: DurationSecs(60),
            key_ttl: DurationSecs(3600),
            heartbeat_interval: Duration::from_secs(30),
            max_heartbeat_failures: 3,
            hook_timeout: Duration::from_secs(5),
            coordinator_heartbeat: Duration::from_secs(2),
            claim_delay: 50..=250,
            relay_timeout: Duration::from_secs(5),
        }
    }

    /// Requires credentials to be bound to the given application
    pub fn with_expected_application(mut self, app: AppId) -> Self {
        self.expected_app = Some(app);
        self
    }

    /// Overrides the query parameter the credential is extracted from
    pub fn with_token_param(mut self, param: impl Into<String>) -> Self {
        self.token_param = param.into();
        self
    }

    /// Overrides the remaining time at which the warning fires
    pub fn with_warning_threshold(mut self, threshold: DurationSecs) -> Self {
        self.warning_threshold = threshold;
        self
    }

    /// Overrides the clock-skew leeway applied to credential timestamps
    pub fn with_leeway(mut self, leeway: DurationSecs) -> Self {
        self.leeway = leeway;
        self
    }

    /// Overrides how long a fetched key set is trusted without refetching
    pub fn with_key_ttl(mut self, ttl: DurationSecs) -> Self {
        self.key_ttl = ttl;
        self
    }

    /// Overrides the liveness-report interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Overrides how many consecutive heartbeat failures are tolerated
    pub fn with_max_heartbeat_failures(mut self, max: u32) -> Self {
        self.max_heartbeat_failures = max;
        self
    }

    /// Overrides the time an advisory hook is given to complete
    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    /// Overrides the coordinator's cross-tab heartbeat interval
    pub fn with_coordinator_heartbeat(mut self, interval: Duration) -> Self {
        self.coordinator_heartbeat = interval;
        self
    }

    /// Overrides how long a follower waits for the coordinator to relay
    /// a request before taking over
    pub fn with_relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }

    /// Draws a randomized claim-window delay
    ///
    /// Tabs arriving simultaneously jitter their claims so one loses the
    /// election decisively rather than racing.
    pub(crate) fn draw_claim_delay(&self) -> Duration {
        let millis = rand::thread_rng().gen_range(self.claim_delay.clone());
        Duration::from_millis(millis)
    }
}

/// Extracts a session credential from a page URL
///
/// Looks for the configured query parameter and returns the raw token,
/// leaving validation to the caller. Returns `None` when the parameter
/// is absent or empty.
pub fn token_from_url(url: &Url, param: &str) -> Option<SessionToken> {
    url.query_pairs()
        .find(|(k, _)| k == param)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
        .map(SessionToken::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_extracted_from_the_configured_parameter() {
        let url = Url::parse("https://app.example.com/page?gwSession=abc.def.ghi&x=1").unwrap();
        let token = token_from_url(&url, DEFAULT_TOKEN_PARAM).unwrap();
        assert_eq!(token.as_str(), "abc.def.ghi");
    }

    #[test]
    fn missing_or_empty_parameter_yields_none() {
        let url = Url::parse("https://app.example.com/page?other=1").unwrap();
        assert!(token_from_url(&url, DEFAULT_TOKEN_PARAM).is_none());

        let url = Url::parse("https://app.example.com/page?gwSession=").unwrap();
        assert!(token_from_url(&url, DEFAULT_TOKEN_PARAM).is_none());
    }

    #[test]
    fn claim_delay_stays_within_bounds() {
        let cfg = EngineConfig::new(Issuer::from_static("https://issuer.example.com"));
        for _ in 0..32 {
            let d = cfg.draw_claim_delay();
            assert!(d >= Duration::from_millis(50));
            assert!(d <= Duration::from_millis(250));
        }
    }
}
