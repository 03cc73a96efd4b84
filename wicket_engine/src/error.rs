//! The engine's error taxonomy
//!
//! Failures are handled at the component that detects them and only
//! propagate when the operation was host-initiated: credential and strict
//! hook failures abort startup, extend/complete failures surface to the
//! caller, and everything else degrades in place.

use std::error::Error as StdError;

use thiserror::Error;

/// An error reaching the marketplace server
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request could not be transported
    #[error("request failed")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("server responded with status {status}")]
    Status {
        /// The response status code
        status: u16,
    },

    /// The response body could not be interpreted
    #[error("unintelligible server response")]
    Body(#[source] Box<dyn StdError + Send + Sync + 'static>),
}

impl ApiError {
    pub(crate) fn body(source: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> Self {
        Self::Body(source.into())
    }
}

/// An error produced by a host-supplied lifecycle hook
///
/// Hosts construct these from whatever failed during their own
/// provisioning; the engine only needs something it can log or act on.
#[derive(Debug, Error)]
#[error("lifecycle hook failed")]
pub struct HookError {
    #[source]
    source: Box<dyn StdError + Send + Sync + 'static>,
}

impl HookError {
    /// Wraps the host-side failure
    pub fn new(source: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Constructs a hook error from a plain message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(message.into())
    }
}

/// Why a hook invocation did not succeed
#[derive(Debug, Error)]
pub enum HookFailure {
    /// The hook returned an error
    #[error("hook '{hook}' failed")]
    Failed {
        /// The name of the hook that failed
        hook: &'static str,
        /// The error the hook returned
        #[source]
        source: HookError,
    },

    /// The hook did not complete within the configured timeout
    #[error("hook '{hook}' timed out")]
    TimedOut {
        /// The name of the hook that timed out
        hook: &'static str,
    },
}

impl HookFailure {
    /// The name of the hook that did not succeed
    pub fn hook(&self) -> &'static str {
        match self {
            Self::Failed { hook, .. } | Self::TimedOut { hook } => hook,
        }
    }
}

/// An error surfaced to the host by the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The session credential failed validation; the engine never started
    #[error("session credential rejected")]
    Credential(#[from] wicket::CredentialError),

    /// No credential was found where one was expected
    #[error("no session credential found")]
    MissingCredential,

    /// The issuer's key set could not be obtained to validate the credential
    #[error("could not obtain the issuer's key set")]
    KeySet(#[source] ApiError),

    /// The start hook failed or timed out; the session never became active
    #[error("session start aborted by host hook")]
    HookFailed(#[from] HookFailure),

    /// The operation requires an active session
    #[error("no active session")]
    NoActiveSession,

    /// A relayed request is still awaiting the coordinator's answer
    #[error("another request is already in flight for this session")]
    Busy,

    /// A host-initiated server operation failed; session state is unchanged
    #[error("server operation failed")]
    Network(#[source] ApiError),

    /// The engine was destroyed
    #[error("engine destroyed")]
    Destroyed,
}
