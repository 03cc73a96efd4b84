//! The session engine and its driving task
//!
//! All mutable session state lives inside a single spawned task. The
//! host talks to it through a [`SessionHandle`]: commands travel over an
//! mpsc channel, state is published through a watch channel, and
//! lifecycle events fan out over a broadcast channel. Server calls are
//! spawned so a slow network never stalls the countdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use url::Url;
use wicket::{credential::CredentialValidator, SessionId, SessionIdRef, SessionTokenRef, ValidatedSession};
use wicket_clock::{Clock, DurationSecs, System, UnixTime};

use crate::api::{dto, SessionApi};
use crate::authority::{AuthorityError, KeyAuthority, KeySetSource};
use crate::bus::{BusMessage, SessionBus, StateChange, TabId};
use crate::config::{token_from_url, EngineConfig};
use crate::coordinator::{Action, Coordinator};
use crate::error::{ApiError, EngineError};
use crate::heartbeat::{floor_remaining, HeartbeatReconciler};
use crate::hooks::{EndReason, NoHooks, SessionHooks};
use crate::lifecycle::{emit, Dispatcher, Phase, SessionEvent};
use crate::timer::{CountdownTimer, TimerSignal, TimerState};

/// The financial outcome of settling a session early
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Settlement {
    /// Billing units refunded for unused time, when the server reports it
    pub tokens_refunded: Option<f64>,
    /// The final billed amount, when the server reports it
    pub final_cost: Option<f64>,
}

/// A point-in-time view of the session, published on every change
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    /// Where the session is in its life
    pub phase: Phase,
    /// Seconds left on the countdown
    pub remaining: DurationSecs,
    /// Whether the countdown is currently ticking
    pub running: bool,
    /// Whether the warning has fired for this session
    pub warning_shown: bool,
    /// Whether this tab currently owns server traffic
    pub is_coordinator: bool,
    /// When the countdown last reconciled against the server
    pub last_server_sync: Option<UnixTime>,
}

enum Command {
    Pause,
    Resume,
    End,
    Extend {
        minutes: u64,
        reply: oneshot::Sender<Result<DurationSecs, EngineError>>,
    },
    Complete {
        usage_minutes: Option<u64>,
        metadata: Option<serde_json::Value>,
        reply: oneshot::Sender<Result<Settlement, EngineError>>,
    },
    Destroy,
}

enum NetOutcome {
    Heartbeat(Result<dto::HeartbeatResponse, ApiError>),
    Extend {
        result: Result<dto::ExtendResponse, ApiError>,
        reply: Option<oneshot::Sender<Result<DurationSecs, EngineError>>>,
    },
    Complete {
        result: Result<dto::CompleteResponse, ApiError>,
        reply: Option<oneshot::Sender<Result<Settlement, EngineError>>>,
    },
}

enum PendingRelay {
    Extend {
        minutes: u64,
        reply: oneshot::Sender<Result<DurationSecs, EngineError>>,
    },
    Complete {
        usage_minutes: Option<u64>,
        reply: oneshot::Sender<Result<Settlement, EngineError>>,
    },
}

/// The entry point for running a session
///
/// Owns the dependencies a session needs and validates the credential
/// before anything else happens. A successful [`start`][Self::start]
/// hands back a [`SessionHandle`] with the countdown already running.
pub struct SessionEngine {
    config: EngineConfig,
    api: Arc<dyn SessionApi>,
    keys: Arc<dyn KeySetSource>,
    bus: Arc<dyn SessionBus>,
    hooks: Arc<dyn SessionHooks>,
    clock: Arc<dyn Clock + Send + Sync>,
    visibility: Option<watch::Receiver<bool>>,
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionEngine {
    /// Assembles an engine from its required dependencies
    #[must_use]
    pub fn new(
        config: EngineConfig,
        api: Arc<dyn SessionApi>,
        keys: Arc<dyn KeySetSource>,
        bus: Arc<dyn SessionBus>,
    ) -> Self {
        Self {
            config,
            api,
            keys,
            bus,
            hooks: Arc::new(NoHooks),
            clock: Arc::new(System),
            visibility: None,
        }
    }

    /// Supplies host lifecycle hooks
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Overrides the wall clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Supplies a page-visibility signal
    ///
    /// A transition to visible triggers an immediate server
    /// reconciliation, catching up a countdown the platform throttled
    /// while the page was hidden.
    #[must_use]
    pub fn with_visibility(mut self, visibility: watch::Receiver<bool>) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// Extracts the credential from a page URL and starts the session
    ///
    /// # Errors
    ///
    /// Returns an error if the URL carries no credential or the
    /// credential is rejected.
    pub async fn start_from_url(self, url: &Url) -> Result<SessionHandle, EngineError> {
        let token =
            token_from_url(url, &self.config.token_param).ok_or(EngineError::MissingCredential)?;
        self.start(&token).await
    }

    /// Validates the credential and starts the session
    ///
    /// The start hook runs to completion before the countdown begins; a
    /// hook failure means the session never becomes active.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential is rejected, the issuer's keys
    /// cannot be obtained, or the start hook fails.
    pub async fn start(self, token: &SessionTokenRef) -> Result<SessionHandle, EngineError> {
        let mut validator = CredentialValidator::new(self.config.issuer.clone())
            .with_leeway(self.config.leeway);
        if let Some(app) = self.config.expected_app.clone() {
            validator = validator.with_expected_application(app);
        }

        let authority = KeyAuthority::new(Arc::clone(&self.keys), validator, self.config.key_ttl);
        let session = authority
            .validate(token, &&*self.clock)
            .await
            .map_err(|err| match err {
                AuthorityError::Credential(err) => EngineError::Credential(err),
                AuthorityError::KeySetFetch(err) => EngineError::KeySet(err),
            })?;

        let dispatcher = Dispatcher::new(Arc::clone(&self.hooks), self.config.hook_timeout);
        dispatcher.start(&session).await?;

        let now = self.clock.now();
        let remaining = session.remaining_at(now);

        let mut timer = CountdownTimer::new();
        let start_signal = timer.start(remaining, self.config.warning_threshold);

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (net_tx, net_rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(64);
        let tab = TabId::random();
        let coordinator = Coordinator::new(
            tab,
            self.config.coordinator_heartbeat,
            self.config.draw_claim_delay(),
        );

        let (state_tx, state_rx) = watch::channel(SessionSnapshot {
            phase: Phase::Active,
            remaining: timer.remaining(),
            running: timer.state() == TimerState::Running,
            warning_shown: timer.warned(),
            is_coordinator: false,
            last_server_sync: None,
        });

        let session_id = session.session_id().to_owned();
        let bus_rx = self.bus.subscribe();
        let heartbeat = HeartbeatReconciler::new(self.config.max_heartbeat_failures);

        let actor = Actor {
            cfg: self.config,
            api: self.api,
            bus: self.bus,
            dispatcher,
            clock: self.clock,
            session,
            timer,
            coordinator,
            heartbeat,
            phase: Phase::Active,
            start_signal,
            state_tx,
            events: events.clone(),
            cmds: cmd_rx,
            bus_rx,
            net_tx,
            net_rx,
            visibility: self.visibility,
            hidden_suspended: false,
            pending_relay: None,
            relay_deadline_at: Instant::now(),
            last_server_sync: None,
            bus_degraded: false,
        };

        tokio::spawn(actor.run());

        Ok(SessionHandle {
            session_id,
            cmds: cmd_tx,
            state: state_rx,
            events,
        })
    }
}

/// A live session, as seen by the host
///
/// Cheap to clone; every clone drives the same session. Dropping the
/// last handle destroys the engine without ending the session on the
/// server.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    cmds: mpsc::Sender<Command>,
    state: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// The logical identifier of the session
    pub fn session_id(&self) -> &SessionIdRef {
        &self.session_id
    }

    /// The current state of the session
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Where the session is in its life
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.state.borrow().phase
    }

    /// Seconds left on the countdown
    #[must_use]
    pub fn remaining(&self) -> DurationSecs {
        self.state.borrow().remaining
    }

    /// The remaining time in clock form, `"M:SS"` or `"H:MM:SS"`
    #[must_use]
    pub fn remaining_clock(&self) -> String {
        format_clock(self.remaining())
    }

    /// The remaining time in spoken form, such as `"12m 5s"`
    #[must_use]
    pub fn remaining_verbose(&self) -> String {
        format_verbose(self.remaining())
    }

    /// Opens a subscription to lifecycle events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Opens a watch over the session state
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Suspends the countdown in every tab
    ///
    /// A no-op once the engine has been destroyed.
    pub async fn pause(&self) {
        self.send_lossy(Command::Pause).await;
    }

    /// Resumes a paused countdown in every tab
    ///
    /// A no-op once the engine has been destroyed.
    pub async fn resume(&self) {
        self.send_lossy(Command::Resume).await;
    }

    /// Ends the session locally without settling with the server
    ///
    /// A no-op once the engine has been destroyed.
    pub async fn end_session(&self) {
        self.send_lossy(Command::End).await;
    }

    /// Purchases additional session time
    ///
    /// Resolves with the remaining time after the extension is granted.
    ///
    /// # Errors
    ///
    /// Returns an error if no session is active, another relayed
    /// request is still pending, the server declines, or the engine
    /// has been destroyed.
    pub async fn extend_session(&self, minutes: u64) -> Result<DurationSecs, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Extend { minutes, reply }).await?;
        rx.await.map_err(|_| EngineError::Destroyed)?
    }

    /// Settles the session early, reporting actual usage
    ///
    /// When `usage_minutes` is `None` the elapsed time is reported.
    ///
    /// # Errors
    ///
    /// Returns an error if no session is active, another relayed
    /// request is still pending, the server declines, or the engine
    /// has been destroyed.
    pub async fn complete_session(
        &self,
        usage_minutes: Option<u64>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Settlement, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Complete {
            usage_minutes,
            metadata,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::Destroyed)?
    }

    /// Tears the engine down without ending the session
    ///
    /// Coordinatorship is released so another tab can take over. No end
    /// hook fires. A no-op if the engine was already destroyed.
    pub async fn destroy(&self) {
        self.send_lossy(Command::Destroy).await;
    }

    async fn send(&self, cmd: Command) -> Result<(), EngineError> {
        self.cmds.send(cmd).await.map_err(|_| EngineError::Destroyed)
    }

    async fn send_lossy(&self, cmd: Command) {
        let _ = self.cmds.send(cmd).await;
    }
}

enum Wake {
    Tick,
    CoordinatorTick,
    HeartbeatTick,
    Bus(BusMessage),
    BusLagged,
    BusClosed,
    Net(NetOutcome),
    Cmd(Option<Command>),
    RelayTimeout,
    Visibility(Option<bool>),
}

struct Actor {
    cfg: EngineConfig,
    api: Arc<dyn SessionApi>,
    bus: Arc<dyn SessionBus>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock + Send + Sync>,
    session: ValidatedSession,
    timer: CountdownTimer,
    coordinator: Coordinator,
    heartbeat: HeartbeatReconciler,
    phase: Phase,
    start_signal: Option<TimerSignal>,
    state_tx: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    cmds: mpsc::Receiver<Command>,
    bus_rx: broadcast::Receiver<BusMessage>,
    net_tx: mpsc::Sender<NetOutcome>,
    net_rx: mpsc::Receiver<NetOutcome>,
    visibility: Option<watch::Receiver<bool>>,
    hidden_suspended: bool,
    pending_relay: Option<PendingRelay>,
    relay_deadline_at: Instant,
    last_server_sync: Option<UnixTime>,
    bus_degraded: bool,
}

impl Actor {
    async fn run(mut self) {
        emit(&self.events, SessionEvent::Started);
        if let Some(signal) = self.start_signal.take() {
            self.on_signal(signal);
        }

        self.publish(BusMessage::ClaimCoordinator {
            session_id: self.session.session_id().to_owned(),
            from: self.coordinator.tab().to_owned(),
        });
        self.publish_state();

        let start = Instant::now();
        let second = Duration::from_secs(1);
        let mut tick = time::interval_at(start + second, second);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut coord_tick = time::interval_at(
            start + self.cfg.coordinator_heartbeat,
            self.cfg.coordinator_heartbeat,
        );
        coord_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut hb_tick = time::interval_at(
            start + self.cfg.heartbeat_interval,
            self.cfg.heartbeat_interval,
        );
        hb_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let relay_deadline = self.relay_deadline();

            let wake = tokio::select! {
                _ = tick.tick() => Wake::Tick,
                _ = coord_tick.tick() => Wake::CoordinatorTick,
                _ = hb_tick.tick() => Wake::HeartbeatTick,
                msg = self.bus_rx.recv() => match msg {
                    Ok(msg) => Wake::Bus(msg),
                    Err(broadcast::error::RecvError::Lagged(_)) => Wake::BusLagged,
                    Err(broadcast::error::RecvError::Closed) => Wake::BusClosed,
                },
                Some(outcome) = self.net_rx.recv() => Wake::Net(outcome),
                cmd = self.cmds.recv() => Wake::Cmd(cmd),
                _ = time::sleep_until(relay_deadline.unwrap_or_else(Instant::now)),
                    if relay_deadline.is_some() => Wake::RelayTimeout,
                vis = async {
                    match self.visibility.as_mut() {
                        Some(rx) => match rx.changed().await {
                            Ok(()) => Some(*rx.borrow()),
                            Err(_) => None,
                        },
                        None => std::future::pending().await,
                    }
                } => Wake::Visibility(vis),
            };

            match wake {
                Wake::Tick => self.on_tick(),
                Wake::CoordinatorTick => self.on_coordinator_tick(),
                Wake::HeartbeatTick => self.on_heartbeat_tick(),
                Wake::Bus(msg) => self.on_bus(msg),
                Wake::BusLagged => {
                    tracing::warn!("broadcast bus subscription lagged; messages dropped");
                }
                Wake::BusClosed => self.on_bus_lost(),
                Wake::Net(outcome) => self.on_net(outcome),
                Wake::Cmd(Some(cmd)) => {
                    if self.on_command(cmd) {
                        break;
                    }
                }
                Wake::Cmd(None) => {
                    self.on_destroy();
                    break;
                }
                Wake::RelayTimeout => self.on_relay_timeout(),
                Wake::Visibility(Some(visible)) => self.on_visibility(visible),
                Wake::Visibility(None) => self.visibility = None,
            }

            self.publish_state();
        }
    }

    fn relay_deadline(&self) -> Option<Instant> {
        self.pending_relay.as_ref().map(|_| self.relay_deadline_at)
    }

    fn on_tick(&mut self) {
        if self.phase.is_live() {
            if let Some(signal) = self.timer.tick() {
                self.on_signal(signal);
            }
        }

        match self
            .coordinator
            .poll(Instant::now(), self.cfg.draw_claim_delay())
        {
            Action::PublishClaim => self.publish_claim(),
            Action::Promoted => self.on_promoted(),
            _ => {}
        }
    }

    fn on_coordinator_tick(&mut self) {
        if self.bus_degraded {
            self.bus_rx = self.bus.subscribe();
            self.bus_degraded = false;
            tracing::info!("rejoined the broadcast bus");
        }

        if !self.coordinator.is_coordinator() || self.phase == Phase::Ended {
            return;
        }

        self.publish(BusMessage::CoordinatorHeartbeat {
            session_id: self.session.session_id().to_owned(),
            from: self.coordinator.tab().to_owned(),
        });
        if self.phase.is_live() {
            self.publish(BusMessage::StateCorrection {
                session_id: self.session.session_id().to_owned(),
                from: self.coordinator.tab().to_owned(),
                change: StateChange::Remaining(self.timer.remaining()),
            });
        }
    }

    fn on_heartbeat_tick(&mut self) {
        if !self.coordinator.is_coordinator()
            || self.heartbeat.is_stopped()
            || !self.phase.is_live()
        {
            return;
        }
        self.spawn_heartbeat();
    }

    fn spawn_heartbeat(&self) {
        let api = Arc::clone(&self.api);
        let id = self.session.session_id().to_owned();
        let tx = self.net_tx.clone();
        let req = dto::HeartbeatRequest {
            timestamp: self.clock.now(),
            active: self.timer.state() == TimerState::Running,
        };
        tokio::spawn(async move {
            let result = api.heartbeat(&id, req).await;
            let _ = tx.send(NetOutcome::Heartbeat(result)).await;
        });
    }

    fn spawn_extend(
        &self,
        minutes: u64,
        reply: Option<oneshot::Sender<Result<DurationSecs, EngineError>>>,
    ) {
        let api = Arc::clone(&self.api);
        let id = self.session.session_id().to_owned();
        let tx = self.net_tx.clone();
        tokio::spawn(async move {
            let result = api
                .extend(
                    &id,
                    dto::ExtendRequest {
                        additional_minutes: minutes,
                    },
                )
                .await;
            let _ = tx.send(NetOutcome::Extend { result, reply }).await;
        });
    }

    fn spawn_complete(
        &self,
        usage_minutes: Option<u64>,
        metadata: Option<serde_json::Value>,
        reply: Option<oneshot::Sender<Result<Settlement, EngineError>>>,
    ) {
        let api = Arc::clone(&self.api);
        let id = self.session.session_id().to_owned();
        let tx = self.net_tx.clone();
        let usage = usage_minutes.unwrap_or_else(|| self.elapsed_minutes());
        tokio::spawn(async move {
            let result = api
                .complete(
                    &id,
                    dto::CompleteRequest {
                        actual_usage_minutes: usage,
                        metadata,
                    },
                )
                .await;
            let _ = tx.send(NetOutcome::Complete { result, reply }).await;
        });
    }

    fn elapsed_minutes(&self) -> u64 {
        let purchased = DurationSecs(self.session.claims().duration_minutes * 60);
        let used = purchased - self.timer.remaining();
        used.0.div_ceil(60)
    }

    fn on_signal(&mut self, signal: TimerSignal) {
        match signal {
            TimerSignal::Warning => {
                self.phase = Phase::Warning;
                let remaining = self.timer.remaining();
                self.dispatcher.warning(remaining);
                emit(&self.events, SessionEvent::Warning { remaining });
            }
            TimerSignal::Ended => self.end_locally(EndReason::Expired),
        }
    }

    fn end_locally(&mut self, reason: EndReason) {
        if self.phase == Phase::Ended {
            return;
        }
        self.phase = Phase::Ending;
        self.timer.end();
        self.dispatcher.end(reason);
        emit(
            &self.events,
            SessionEvent::Ended {
                reason: reason.into(),
            },
        );
        self.phase = Phase::Ended;
        tracing::info!(session_id = %self.session.session_id(), ?reason, "session ended");
    }

    fn end_everywhere(&mut self, reason: EndReason) {
        self.end_locally(reason);
        self.publish(BusMessage::StateCorrection {
            session_id: self.session.session_id().to_owned(),
            from: self.coordinator.tab().to_owned(),
            change: StateChange::Completed,
        });
    }

    fn on_promoted(&mut self) {
        tracing::info!(tab = %self.coordinator.tab(), "took over session coordination");
        self.heartbeat.reset();
        self.publish(BusMessage::CoordinatorHeartbeat {
            session_id: self.session.session_id().to_owned(),
            from: self.coordinator.tab().to_owned(),
        });
    }

    fn publish_claim(&mut self) {
        self.publish(BusMessage::ClaimCoordinator {
            session_id: self.session.session_id().to_owned(),
            from: self.coordinator.tab().to_owned(),
        });
    }

    fn on_bus(&mut self, msg: BusMessage) {
        if msg.session_id() != self.session.session_id()
            || msg.from() == self.coordinator.tab()
        {
            return;
        }

        match msg {
            BusMessage::ClaimCoordinator { from, .. } => {
                if self.coordinator.on_claim(&from) == Action::ReassertLeadership {
                    self.reassert();
                }
            }
            BusMessage::CoordinatorHeartbeat { from, .. } => {
                match self.coordinator.on_heartbeat(&from) {
                    Action::ReassertLeadership => self.reassert(),
                    Action::Demoted => {
                        tracing::info!(to = %from, "ceded session coordination");
                    }
                    _ => {}
                }
            }
            BusMessage::CoordinatorReleased { .. } => {
                let delay = self.cfg.draw_claim_delay();
                if self.coordinator.on_released(delay) == Action::PublishClaim {
                    self.publish_claim();
                }
            }
            BusMessage::StateCorrection { change, .. } => self.on_correction(change),
            BusMessage::ExtendRequest {
                additional_minutes, ..
            } => {
                if self.coordinator.is_coordinator() && self.phase.is_live() {
                    self.spawn_extend(additional_minutes, None);
                }
            }
            BusMessage::CompleteRequest {
                actual_usage_minutes,
                ..
            } => {
                if self.coordinator.is_coordinator() && self.phase.is_live() {
                    self.spawn_complete(actual_usage_minutes, None, None);
                }
            }
        }
    }

    fn on_correction(&mut self, change: StateChange) {
        match change {
            StateChange::Paused => {
                if self.timer.state() == TimerState::Running {
                    self.timer.pause();
                    emit(&self.events, SessionEvent::Paused);
                }
            }
            StateChange::Resumed => {
                if self.timer.state() == TimerState::Paused {
                    self.timer.resume();
                    emit(&self.events, SessionEvent::Resumed);
                }
            }
            StateChange::Remaining(asserted) => {
                if let Some(signal) = self.timer.apply_correction(asserted) {
                    self.on_signal(signal);
                }
            }
            StateChange::Extended(remaining) => {
                if self.phase.is_live() {
                    self.timer.extend_to(remaining);
                    self.dispatcher.extend(remaining);
                    emit(&self.events, SessionEvent::Extended { remaining });
                }
                if let Some(PendingRelay::Extend { reply, .. }) = self.take_pending_extend() {
                    let _ = reply.send(Ok(remaining));
                }
            }
            StateChange::Completed => {
                if let Some(PendingRelay::Complete { reply, .. }) = self.take_pending_complete() {
                    let _ = reply.send(Ok(Settlement::default()));
                }
                self.end_locally(EndReason::Completed);
            }
        }
    }

    fn take_pending_extend(&mut self) -> Option<PendingRelay> {
        if matches!(self.pending_relay, Some(PendingRelay::Extend { .. })) {
            self.pending_relay.take()
        } else {
            None
        }
    }

    fn take_pending_complete(&mut self) -> Option<PendingRelay> {
        if matches!(self.pending_relay, Some(PendingRelay::Complete { .. })) {
            self.pending_relay.take()
        } else {
            None
        }
    }

    fn reassert(&mut self) {
        self.publish(BusMessage::CoordinatorHeartbeat {
            session_id: self.session.session_id().to_owned(),
            from: self.coordinator.tab().to_owned(),
        });
    }

    fn on_net(&mut self, outcome: NetOutcome) {
        match outcome {
            NetOutcome::Heartbeat(Ok(resp)) => {
                self.heartbeat.record_success();
                self.last_server_sync = Some(self.clock.now());
                if resp.status != "active" {
                    tracing::info!(status = %resp.status, "server reports session over");
                    self.end_everywhere(EndReason::Expired);
                    return;
                }
                let asserted = floor_remaining(resp.remaining_seconds);
                if let Some(signal) = self.timer.apply_correction(asserted) {
                    self.on_signal(signal);
                }
                if self.phase.is_live() {
                    self.publish(BusMessage::StateCorrection {
                        session_id: self.session.session_id().to_owned(),
                        from: self.coordinator.tab().to_owned(),
                        change: StateChange::Remaining(self.timer.remaining()),
                    });
                }
            }
            NetOutcome::Heartbeat(Err(err)) => {
                let error: &dyn std::error::Error = &err;
                tracing::warn!(error, "heartbeat failed");
                self.heartbeat.record_failure();
            }
            NetOutcome::Extend { result, reply } => match result {
                Ok(resp) => {
                    let remaining = resp.new_expires_at - self.clock.now();
                    if self.phase.is_live() {
                        self.timer.extend_to(remaining);
                        self.dispatcher.extend(remaining);
                        emit(&self.events, SessionEvent::Extended { remaining });
                        self.publish(BusMessage::StateCorrection {
                            session_id: self.session.session_id().to_owned(),
                            from: self.coordinator.tab().to_owned(),
                            change: StateChange::Extended(remaining),
                        });
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(remaining));
                    }
                }
                Err(err) => {
                    let error: &dyn std::error::Error = &err;
                    tracing::warn!(error, "extension declined");
                    emit(
                        &self.events,
                        SessionEvent::Error {
                            operation: "extend",
                            message: err.to_string(),
                        },
                    );
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(EngineError::Network(err)));
                    }
                }
            },
            NetOutcome::Complete { result, reply } => match result {
                Ok(resp) => {
                    let settlement = Settlement {
                        tokens_refunded: resp.tokens_refunded,
                        final_cost: resp.final_cost,
                    };
                    self.end_everywhere(EndReason::Completed);
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(settlement));
                    }
                }
                Err(err) => {
                    let error: &dyn std::error::Error = &err;
                    tracing::warn!(error, "completion declined");
                    emit(
                        &self.events,
                        SessionEvent::Error {
                            operation: "complete",
                            message: err.to_string(),
                        },
                    );
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(EngineError::Network(err)));
                    }
                }
            },
        }
    }

    fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Pause => {
                if self.timer.state() == TimerState::Running {
                    self.timer.pause();
                    emit(&self.events, SessionEvent::Paused);
                    self.publish(BusMessage::StateCorrection {
                        session_id: self.session.session_id().to_owned(),
                        from: self.coordinator.tab().to_owned(),
                        change: StateChange::Paused,
                    });
                }
                false
            }
            Command::Resume => {
                if self.timer.state() == TimerState::Paused {
                    self.timer.resume();
                    emit(&self.events, SessionEvent::Resumed);
                    self.publish(BusMessage::StateCorrection {
                        session_id: self.session.session_id().to_owned(),
                        from: self.coordinator.tab().to_owned(),
                        change: StateChange::Resumed,
                    });
                }
                false
            }
            Command::End => {
                self.end_everywhere(EndReason::HostEnded);
                false
            }
            Command::Extend { minutes, reply } => {
                if !self.phase.is_live() {
                    let _ = reply.send(Err(EngineError::NoActiveSession));
                } else if self.coordinator.is_coordinator() || self.bus_degraded {
                    self.spawn_extend(minutes, Some(reply));
                } else {
                    self.relay(
                        BusMessage::ExtendRequest {
                            session_id: self.session.session_id().to_owned(),
                            from: self.coordinator.tab().to_owned(),
                            additional_minutes: minutes,
                        },
                        PendingRelay::Extend { minutes, reply },
                    );
                }
                false
            }
            Command::Complete {
                usage_minutes,
                metadata,
                reply,
            } => {
                if !self.phase.is_live() {
                    let _ = reply.send(Err(EngineError::NoActiveSession));
                } else if self.coordinator.is_coordinator() || self.bus_degraded {
                    self.spawn_complete(usage_minutes, metadata, Some(reply));
                } else {
                    self.relay(
                        BusMessage::CompleteRequest {
                            session_id: self.session.session_id().to_owned(),
                            from: self.coordinator.tab().to_owned(),
                            actual_usage_minutes: usage_minutes,
                        },
                        PendingRelay::Complete {
                            usage_minutes,
                            reply,
                        },
                    );
                }
                false
            }
            Command::Destroy => {
                self.on_destroy();
                true
            }
        }
    }

    fn relay(&mut self, msg: BusMessage, pending: PendingRelay) {
        // One relayed request at a time; a second would orphan the
        // first caller's reply
        if self.pending_relay.is_some() {
            match pending {
                PendingRelay::Extend { reply, .. } => {
                    let _ = reply.send(Err(EngineError::Busy));
                }
                PendingRelay::Complete { reply, .. } => {
                    let _ = reply.send(Err(EngineError::Busy));
                }
            }
            return;
        }

        self.publish(msg);
        if self.bus_degraded {
            // The publish just failed; act as our own coordinator
            match pending {
                PendingRelay::Extend { minutes, reply } => self.spawn_extend(minutes, Some(reply)),
                PendingRelay::Complete {
                    usage_minutes,
                    reply,
                } => self.spawn_complete(usage_minutes, None, Some(reply)),
            }
        } else {
            self.relay_deadline_at = Instant::now() + self.cfg.relay_timeout;
            self.pending_relay = Some(pending);
        }
    }

    fn on_relay_timeout(&mut self) {
        let Some(pending) = self.pending_relay.take() else {
            return;
        };
        tracing::warn!("coordinator did not answer a relayed request; taking over");
        if self.coordinator.start_election(self.cfg.draw_claim_delay()) == Action::PublishClaim {
            self.publish_claim();
        }
        match pending {
            PendingRelay::Extend { minutes, reply } => self.spawn_extend(minutes, Some(reply)),
            PendingRelay::Complete {
                usage_minutes,
                reply,
            } => self.spawn_complete(usage_minutes, None, Some(reply)),
        }
    }

    fn on_bus_lost(&mut self) {
        if !self.bus_degraded {
            tracing::warn!("broadcast bus lost; continuing with an independent countdown");
            self.bus_degraded = true;
            if !self.coordinator.is_coordinator() {
                self.coordinator.start_election(self.cfg.draw_claim_delay());
            }
        }
    }

    // Visibility suspensions are local: a hidden tab stops its own
    // countdown but never pauses the session for its siblings.
    fn on_visibility(&mut self, visible: bool) {
        if !visible {
            if self.timer.state() == TimerState::Running {
                self.timer.pause();
                self.hidden_suspended = true;
                tracing::debug!("page hidden; suspending the local countdown");
            }
        } else {
            if self.hidden_suspended {
                self.hidden_suspended = false;
                self.timer.resume();
            }
            if self.coordinator.is_coordinator()
                && !self.heartbeat.is_stopped()
                && self.phase.is_live()
            {
                tracing::debug!("page became visible; reconciling with the server");
                self.spawn_heartbeat();
            }
        }
    }

    fn on_destroy(&mut self) {
        if self.coordinator.is_coordinator() {
            self.publish(BusMessage::CoordinatorReleased {
                session_id: self.session.session_id().to_owned(),
                from: self.coordinator.tab().to_owned(),
            });
        }
        tracing::debug!(session_id = %self.session.session_id(), "engine destroyed");
    }

    fn publish(&mut self, msg: BusMessage) {
        if let Err(err) = self.bus.publish(msg) {
            let error: &dyn std::error::Error = &err;
            if !self.bus_degraded {
                tracing::warn!(error, "broadcast bus rejected a publication");
            }
            self.on_bus_lost();
        }
    }

    fn publish_state(&self) {
        let snapshot = SessionSnapshot {
            phase: self.phase,
            remaining: self.timer.remaining(),
            running: self.timer.state() == TimerState::Running,
            warning_shown: self.timer.warned(),
            is_coordinator: self.coordinator.is_coordinator(),
            last_server_sync: self.last_server_sync,
        };
        self.state_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

/// Formats a duration as `"M:SS"`, or `"H:MM:SS"` once it reaches an hour
#[must_use]
pub fn format_clock(d: DurationSecs) -> String {
    let (h, m, s) = (d.0 / 3600, (d.0 % 3600) / 60, d.0 % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

/// Formats a duration in spoken form, such as `"1h 5m"` or `"12m 5s"`
#[must_use]
pub fn format_verbose(d: DurationSecs) -> String {
    let (h, m, s) = (d.0 / 3600, (d.0 % 3600) / 60, d.0 % 60);
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_format_is_compact() {
        assert_eq!(format_clock(DurationSecs(0)), "0:00");
        assert_eq!(format_clock(DurationSecs(65)), "1:05");
        assert_eq!(format_clock(DurationSecs(600)), "10:00");
        assert_eq!(format_clock(DurationSecs(3600)), "1:00:00");
        assert_eq!(format_clock(DurationSecs(3723)), "1:02:03");
    }

    #[test]
    fn verbose_format_drops_empty_units() {
        assert_eq!(format_verbose(DurationSecs(0)), "0s");
        assert_eq!(format_verbose(DurationSecs(59)), "59s");
        assert_eq!(format_verbose(DurationSecs(725)), "12m 5s");
        assert_eq!(format_verbose(DurationSecs(3900)), "1h 5m");
    }
}
