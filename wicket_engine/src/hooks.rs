//! Host integration points in the session lifecycle
//!
//! Every hook has a no-op default, so hosts implement only what they
//! care about. Only [`on_session_start`][SessionHooks::on_session_start]
//! gates the lifecycle; the rest are advisory and their failures are
//! logged rather than propagated.

use async_trait::async_trait;
use wicket::ValidatedSession;
use wicket_clock::DurationSecs;

use crate::error::HookError;

/// Why a session reached its end
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// The countdown reached zero
    Expired,
    /// The host settled the session early
    Completed,
    /// The host ended the session without settling
    HostEnded,
}

/// Host-supplied lifecycle hooks
///
/// Implementations must be cheap to share; the engine holds them behind
/// an `Arc` and may invoke the advisory hooks from spawned tasks.
#[async_trait]
pub trait SessionHooks: Send + Sync + 'static {
    /// Invoked after credential validation, before the countdown starts
    ///
    /// This is the host's provisioning window. An error here aborts the
    /// session entirely; it never becomes active.
    async fn on_session_start(&self, session: &ValidatedSession) -> Result<(), HookError> {
        let _ = session;
        Ok(())
    }

    /// Invoked once per session when the countdown crosses the warning
    /// threshold
    async fn on_session_warning(&self, remaining: DurationSecs) -> Result<(), HookError> {
        let _ = remaining;
        Ok(())
    }

    /// Invoked when the session ends, with the reason
    async fn on_session_end(&self, reason: EndReason) -> Result<(), HookError> {
        let _ = reason;
        Ok(())
    }

    /// Invoked after a granted extension, with the new remaining time
    async fn on_session_extend(&self, remaining: DurationSecs) -> Result<(), HookError> {
        let _ = remaining;
        Ok(())
    }
}

/// The hooks used when a host supplies none
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

#[async_trait]
impl SessionHooks for NoHooks {}
