//! A client-side lifecycle engine for marketplace sessions
//!
//! A partner application embedding a purchased session runs one of these
//! engines per tab. The engine validates the session credential against
//! the issuer's published keys, runs a local one-second countdown,
//! reconciles it against the server on a heartbeat, coordinates with
//! sibling tabs so exactly one of them talks to the server, and invokes
//! host hooks at the lifecycle moments the host cares about:
//!
//! * [`config`]: how a session runs, and credential extraction from URLs
//! * [`authority`]: cached key fetching and credential validation
//! * [`timer`]: the monotonic countdown with its warning threshold
//! * [`bus`] and [`coordinator`]: cross-tab messaging and election
//! * [`heartbeat`] and [`api`]: server reconciliation
//! * [`hooks`] and [`lifecycle`]: host integration and events
//! * the engine itself: the driving task and the [`SessionHandle`] the
//!   host holds
//!
//! The countdown is deliberately pessimistic: server corrections only
//! ever shorten it, and the one operation that may lengthen it is an
//! explicit, server-granted extension.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod api;
pub mod authority;
pub mod bus;
pub mod config;
pub mod coordinator;
mod engine;
pub mod error;
pub mod heartbeat;
pub mod hooks;
pub mod lifecycle;
pub mod timer;

pub use config::EngineConfig;
pub use engine::{
    format_clock, format_verbose, SessionEngine, SessionHandle, SessionSnapshot, Settlement,
};
pub use error::{EngineError, HookError};
pub use hooks::{EndReason, SessionHooks};
pub use lifecycle::{Phase, SessionEvent};
