//! Lifecycle phases, events, and hook dispatch

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use wicket::ValidatedSession;
use wicket_clock::DurationSecs;

use crate::error::{HookError, HookFailure};
use crate::hooks::{EndReason, SessionHooks};

/// Where a session is in its life
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No session has been started
    NotStarted,
    /// The credential validated; the start hook is running
    Starting,
    /// The countdown is running or paused
    Active,
    /// Active, and the warning threshold has been crossed
    Warning,
    /// The session is being settled or torn down
    Ending,
    /// The session is over
    Ended,
    /// Startup failed; the session never became active
    Failed,
}

impl Phase {
    /// Whether the session is live (countdown exists and has not ended)
    pub fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Warning)
    }
}

/// A lifecycle notification delivered to event subscribers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session became active
    Started,
    /// The warning threshold was crossed
    Warning {
        /// Time left when the warning fired
        remaining: DurationSecs,
    },
    /// The countdown was paused
    Paused,
    /// The countdown resumed
    Resumed,
    /// The session was extended
    Extended {
        /// Time left after the extension
        remaining: DurationSecs,
    },
    /// The session ended
    Ended {
        /// Why the session ended
        reason: EndReasonEvent,
    },
    /// A server call failed
    ///
    /// The countdown is unaffected; this exists so subscribers other
    /// than the caller can surface the failure.
    Error {
        /// The call that failed
        operation: &'static str,
        /// A description of the failure
        message: String,
    },
}

/// The end reason as carried on the event stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReasonEvent {
    /// The countdown reached zero
    Expired,
    /// The host settled the session early
    Completed,
    /// The host ended the session without settling
    HostEnded,
}

impl From<EndReason> for EndReasonEvent {
    fn from(reason: EndReason) -> Self {
        match reason {
            EndReason::Expired => Self::Expired,
            EndReason::Completed => Self::Completed,
            EndReason::HostEnded => Self::HostEnded,
        }
    }
}

/// Invokes host hooks with the engine's failure policy applied
///
/// The start hook is awaited and its failure propagates. The advisory
/// hooks run in the background; a failure or timeout is logged and the
/// lifecycle proceeds. Every hook runs on its own task, so one that
/// outlives its timeout keeps running detached; it merely stops gating
/// engine state.
pub(crate) struct Dispatcher {
    hooks: Arc<dyn SessionHooks>,
    timeout: Duration,
}

impl Dispatcher {
    pub(crate) fn new(hooks: Arc<dyn SessionHooks>, timeout: Duration) -> Self {
        Self { hooks, timeout }
    }

    pub(crate) async fn start(&self, session: &ValidatedSession) -> Result<(), HookFailure> {
        let hooks = Arc::clone(&self.hooks);
        let session = session.clone();
        let running = tokio::spawn(async move { hooks.on_session_start(&session).await });
        match tokio::time::timeout(self.timeout, running).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(source))) => Err(HookFailure::Failed {
                hook: "on_session_start",
                source,
            }),
            Ok(Err(_)) => Err(HookFailure::Failed {
                hook: "on_session_start",
                source: HookError::msg("hook task panicked"),
            }),
            Err(_) => Err(HookFailure::TimedOut {
                hook: "on_session_start",
            }),
        }
    }

    pub(crate) fn warning(&self, remaining: DurationSecs) {
        self.spawn_advisory("on_session_warning", {
            let hooks = Arc::clone(&self.hooks);
            async move { hooks.on_session_warning(remaining).await }
        });
    }

    pub(crate) fn end(&self, reason: EndReason) {
        self.spawn_advisory("on_session_end", {
            let hooks = Arc::clone(&self.hooks);
            async move { hooks.on_session_end(reason).await }
        });
    }

    pub(crate) fn extend(&self, remaining: DurationSecs) {
        self.spawn_advisory("on_session_extend", {
            let hooks = Arc::clone(&self.hooks);
            async move { hooks.on_session_extend(remaining).await }
        });
    }

    fn spawn_advisory<F>(&self, hook: &'static str, fut: F)
    where
        F: std::future::Future<Output = Result<(), HookError>> + Send + 'static,
    {
        let timeout = self.timeout;
        let running = tokio::spawn(fut);
        tokio::spawn(async move {
            // Timing out drops the join handle, not the hook's task
            match tokio::time::timeout(timeout, running).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    let error: &dyn std::error::Error = &err;
                    tracing::warn!(error, hook, "lifecycle hook failed");
                }
                Ok(Err(_)) => {
                    tracing::warn!(hook, "lifecycle hook panicked");
                }
                Err(_) => {
                    tracing::warn!(hook, "lifecycle hook timed out; left running");
                }
            }
        });
    }
}

/// Publishes an event, tolerating the absence of subscribers
pub(crate) fn emit(events: &broadcast::Sender<SessionEvent>, event: SessionEvent) {
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;

    struct SlowWarning {
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SessionHooks for SlowWarning {
        async fn on_session_warning(&self, _remaining: DurationSecs) -> Result<(), HookError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn an_advisory_hook_that_outlives_its_timeout_still_finishes() {
        let finished = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher::new(
            Arc::new(SlowWarning {
                finished: Arc::clone(&finished),
            }),
            Duration::from_secs(5),
        );

        dispatcher.warning(DurationSecs(300));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(finished.load(Ordering::SeqCst), "the hook was cancelled");
    }
}
