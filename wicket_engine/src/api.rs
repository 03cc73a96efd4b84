//! The server endpoints backing a live session
//!
//! The engine talks to three endpoints: heartbeat, renewal, and
//! completion. The trait seam exists so tests and embedded hosts can
//! substitute their own transport.

use async_trait::async_trait;
use reqwest::Client;
use url::Url;
use wicket::SessionIdRef;

use crate::error::ApiError;

/// The request and response bodies for the session endpoints
///
/// Body keys are snake_case on the wire; only the credential claims use
/// camelCase.
pub mod dto {
    use serde::{Deserialize, Serialize};
    use wicket_clock::UnixTime;

    /// The liveness report a coordinator tab sends on an interval
    #[derive(Debug, Clone, Serialize)]
    pub struct HeartbeatRequest {
        /// The client's wall clock at the moment of the report, in Unix
        /// seconds
        pub timestamp: UnixTime,
        /// Whether the countdown was running when the report was sent
        pub active: bool,
    }

    /// The server's authoritative view of the session
    #[derive(Debug, Clone, Deserialize)]
    pub struct HeartbeatResponse {
        /// Remaining time as the server computes it, possibly fractional
        pub remaining_seconds: f64,
        /// The server-side session status, `"active"` while the session
        /// is live
        pub status: String,
    }

    /// A request to purchase additional session time
    #[derive(Debug, Clone, Serialize)]
    pub struct ExtendRequest {
        /// The number of whole minutes to add
        pub additional_minutes: u64,
    }

    /// The outcome of a granted extension
    #[derive(Debug, Clone, Deserialize)]
    pub struct ExtendResponse {
        /// The new absolute expiry, in Unix seconds
        pub new_expires_at: UnixTime,
        /// The cost of the added time, in the server's billing unit
        #[serde(default)]
        pub additional_cost: Option<f64>,
    }

    /// An early completion with the actual usage to bill
    #[derive(Debug, Clone, Serialize)]
    pub struct CompleteRequest {
        /// Whole minutes of the session actually consumed
        pub actual_usage_minutes: u64,
        /// Host-supplied context forwarded verbatim
        #[serde(skip_serializing_if = "Option::is_none")]
        pub metadata: Option<serde_json::Value>,
    }

    /// The settlement for a completed session
    #[derive(Debug, Clone, Deserialize)]
    pub struct CompleteResponse {
        /// Billing units refunded for unused time
        #[serde(default)]
        pub tokens_refunded: Option<f64>,
        /// The final billed amount
        #[serde(default)]
        pub final_cost: Option<f64>,
    }
}

/// An asynchronous source of session lifecycle calls
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Reports liveness and obtains the server's remaining time
    async fn heartbeat(
        &self,
        session_id: &SessionIdRef,
        req: dto::HeartbeatRequest,
    ) -> Result<dto::HeartbeatResponse, ApiError>;

    /// Purchases additional time for the session
    async fn extend(
        &self,
        session_id: &SessionIdRef,
        req: dto::ExtendRequest,
    ) -> Result<dto::ExtendResponse, ApiError>;

    /// Settles the session early with the actual usage
    async fn complete(
        &self,
        session_id: &SessionIdRef,
        req: dto::CompleteRequest,
    ) -> Result<dto::CompleteResponse, ApiError>;
}

#[async_trait]
impl<T> SessionApi for std::sync::Arc<T>
where
    T: SessionApi + ?Sized,
{
    async fn heartbeat(
        &self,
        session_id: &SessionIdRef,
        req: dto::HeartbeatRequest,
    ) -> Result<dto::HeartbeatResponse, ApiError> {
        (**self).heartbeat(session_id, req).await
    }

    async fn extend(
        &self,
        session_id: &SessionIdRef,
        req: dto::ExtendRequest,
    ) -> Result<dto::ExtendResponse, ApiError> {
        (**self).extend(session_id, req).await
    }

    async fn complete(
        &self,
        session_id: &SessionIdRef,
        req: dto::CompleteRequest,
    ) -> Result<dto::CompleteResponse, ApiError> {
        (**self).complete(session_id, req).await
    }
}

/// A [`SessionApi`] over HTTP, rooted at the service base URL
#[derive(Debug, Clone)]
pub struct HttpSessionApi {
    client: Client,
    base: Url,
}

impl HttpSessionApi {
    /// Constructs the API client against a base URL
    ///
    /// The base should include any path prefix the service is mounted
    /// under, for example `https://api.example.com/v1/`.
    pub fn new(client: Client, base: Url) -> Self {
        Self { client, base }
    }

    fn session_url(&self, session_id: &SessionIdRef, action: &str) -> Result<Url, ApiError> {
        self.base
            .join(&format!("sessions/{}/{}", session_id, action))
            .map_err(|err| ApiError::body(err))
    }

    async fn read<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
            });
        }
        resp.json().await.map_err(|err| ApiError::body(err))
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    #[tracing::instrument(level = "debug", skip(self, req), fields(session_id = %session_id))]
    async fn heartbeat(
        &self,
        session_id: &SessionIdRef,
        req: dto::HeartbeatRequest,
    ) -> Result<dto::HeartbeatResponse, ApiError> {
        let url = self.session_url(session_id, "heartbeat")?;
        let resp = self.client.post(url).json(&req).send().await?;
        Self::read(resp).await
    }

    #[tracing::instrument(level = "debug", skip(self, req), fields(session_id = %session_id))]
    async fn extend(
        &self,
        session_id: &SessionIdRef,
        req: dto::ExtendRequest,
    ) -> Result<dto::ExtendResponse, ApiError> {
        let url = self.session_url(session_id, "renew")?;
        let resp = self.client.put(url).json(&req).send().await?;
        Self::read(resp).await
    }

    #[tracing::instrument(level = "debug", skip(self, req), fields(session_id = %session_id))]
    async fn complete(
        &self,
        session_id: &SessionIdRef,
        req: dto::CompleteRequest,
    ) -> Result<dto::CompleteResponse, ApiError> {
        let url = self.session_url(session_id, "complete")?;
        let resp = self.client.post(url).json(&req).send().await?;
        Self::read(resp).await
    }
}

#[cfg(test)]
mod tests {
    use wicket_clock::UnixTime;

    use super::dto;

    #[test]
    fn heartbeat_bodies_use_snake_case_keys() {
        let req = dto::HeartbeatRequest {
            timestamp: UnixTime(1_700_000_000),
            active: true,
        };
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"timestamp": 1_700_000_000u64, "active": true})
        );

        let resp: dto::HeartbeatResponse =
            serde_json::from_str(r#"{"remaining_seconds": 1199.4, "status": "active"}"#).unwrap();
        assert_eq!(resp.remaining_seconds, 1199.4);
        assert_eq!(resp.status, "active");
    }

    #[test]
    fn extension_bodies_use_snake_case_keys() {
        let req = dto::ExtendRequest {
            additional_minutes: 10,
        };
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body, serde_json::json!({"additional_minutes": 10}));

        let resp: dto::ExtendResponse =
            serde_json::from_str(r#"{"new_expires_at": 1700001200, "additional_cost": 2.5}"#)
                .unwrap();
        assert_eq!(resp.new_expires_at, UnixTime(1_700_001_200));
        assert_eq!(resp.additional_cost, Some(2.5));
    }

    #[test]
    fn completion_bodies_use_snake_case_keys() {
        let req = dto::CompleteRequest {
            actual_usage_minutes: 42,
            metadata: None,
        };
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body, serde_json::json!({"actual_usage_minutes": 42}));

        let resp: dto::CompleteResponse =
            serde_json::from_str(r#"{"tokens_refunded": 5.0, "final_cost": 10.0}"#).unwrap();
        assert_eq!(resp.tokens_refunded, Some(5.0));
        assert_eq!(resp.final_cost, Some(10.0));
    }

    #[test]
    fn settlement_fields_the_server_omits_read_as_absent() {
        let resp: dto::CompleteResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(resp.tokens_refunded, None);
        assert_eq!(resp.final_cost, None);
    }
}
