//! Session Synchronizer
//!
//! Client-side authority for one game session. Owns the [`GameState`],
//! consumes the session and team channels in a single dispatch loop and
//! exposes a request/response facade over the one-way event stream.
//!
//! ```text
//!  game channel ─┐                        ┌─► GameState
//!                ├─► dispatch ─► barrier ─┼─► correlator   (own results)
//!  team channel ─┘                        └─► visibility / phase notices
//!
//!  request_hide / request_seek ─► publish ─► ... ─► correlator ─► caller
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{PlayerInit, SessionConfig};
use crate::game::hooks::Collaborators;
use crate::game::phase::Phase;
use crate::game::player::{Player, PlayerId, Position};
use crate::game::state::{GameState, RoundInfo, SafeZone, StateError, Teams};
use crate::game::team::Team;
use crate::network::barrier::{wait_open, Admission, InitBarrier};
use crate::network::correlator::{CorrelatorError, RequestCorrelator, Resolution};
use crate::network::protocol::{
    Destinations, InboundMessage, InteractCommand, InteractionKind, InteractionResult,
    ProtocolError, RequestId,
};
use crate::network::transport::{Subscription, TransportError, TransportHandle};

/// Which subscription a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Session-scoped channel.
    Game,
    /// Team-scoped channel.
    Team,
}

/// What dispatch did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Handler ran (plus any replayed messages, for the bootstrap).
    Applied,
    /// Held until the session is initialized.
    Stalled,
}

/// Outcome of a hide or seek command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteractionReply {
    /// Did the server accept it?
    pub is_succeeded: bool,
}

/// A message the dispatch loop could not process.
#[derive(Debug)]
pub struct DispatchFailure {
    /// Source channel.
    pub channel: Channel,
    /// Raw body as received.
    pub raw: String,
    /// Why it failed.
    pub error: SessionError,
}

struct SessionInner {
    state: GameState,
    barrier: InitBarrier,
}

enum LoopEvent {
    Game(Option<String>),
    Team(Option<String>),
    AttachTeam(Subscription),
}

/// One game session, shared behind an [`Arc`].
pub struct GameSession {
    room_id: String,
    game_destination: String,
    config: SessionConfig,
    destinations: Destinations,
    collaborators: Collaborators,
    transport: TransportHandle,
    inner: RwLock<SessionInner>,
    correlator: RequestCorrelator,
    initialized: watch::Receiver<bool>,
    player_claimed: AtomicBool,
    team_tx: mpsc::UnboundedSender<Subscription>,
    team_rx: Mutex<Option<mpsc::UnboundedReceiver<Subscription>>>,
}

impl GameSession {
    /// Create a session for `room_id`, bootstrapped from `game_destination`.
    ///
    /// The transport does not have to be connected yet; the dispatch loop
    /// started by [`spawn`](Self::spawn) waits for it.
    pub fn new(
        room_id: impl Into<String>,
        game_destination: impl Into<String>,
        transport: TransportHandle,
        collaborators: Collaborators,
        config: SessionConfig,
    ) -> Self {
        let room_id = room_id.into();
        let barrier = InitBarrier::with_capacity(config.max_stalled_messages);
        let initialized = barrier.subscribe();
        let (team_tx, team_rx) = mpsc::unbounded_channel();

        Self {
            destinations: Destinations::for_room(&config.destination_prefix, &room_id),
            inner: RwLock::new(SessionInner {
                state: GameState::new(room_id.clone(), config.max_seek_count),
                barrier,
            }),
            room_id,
            game_destination: game_destination.into(),
            config,
            collaborators,
            transport,
            correlator: RequestCorrelator::new(),
            initialized,
            player_claimed: AtomicBool::new(false),
            team_tx,
            team_rx: Mutex::new(Some(team_rx)),
        }
    }

    // =========================================================================
    // DISPATCH LOOP
    // =========================================================================

    /// Start the dispatch loop. Can be called once.
    ///
    /// Failed messages are logged and reported on the returned receiver;
    /// the loop carries on with the next one.
    pub fn spawn(self: &Arc<Self>) -> Result<(JoinHandle<()>, mpsc::Receiver<DispatchFailure>), SessionError> {
        let team_rx = self
            .team_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SessionError::AlreadyRunning)?;
        let (failures_tx, failures_rx) = mpsc::channel(self.config.failure_channel_capacity);

        let session = Arc::clone(self);
        let handle = tokio::spawn(async move { session.run(team_rx, failures_tx).await });
        Ok((handle, failures_rx))
    }

    async fn run(
        self: Arc<Self>,
        mut team_control: mpsc::UnboundedReceiver<Subscription>,
        failures: mpsc::Sender<DispatchFailure>,
    ) {
        let mut handle = self.transport.clone();
        let transport = match handle.ready().await {
            Ok(transport) => transport,
            Err(e) => {
                error!(room = %self.room_id, "Transport never became ready: {}", e);
                return;
            }
        };

        let mut game = match transport.subscribe(&self.game_destination) {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(destination = %self.game_destination, "Game subscription failed: {}", e);
                return;
            }
        };
        info!(room = %self.room_id, destination = %self.game_destination, "Game channel subscribed");

        let mut team: Option<Subscription> = None;
        loop {
            let event = tokio::select! {
                raw = game.recv() => LoopEvent::Game(raw),
                raw = recv_optional(&mut team) => LoopEvent::Team(raw),
                Some(subscription) = team_control.recv() => LoopEvent::AttachTeam(subscription),
            };

            match event {
                LoopEvent::Game(Some(raw)) => self.handle_raw(Channel::Game, raw, &failures).await,
                LoopEvent::Game(None) => {
                    warn!(room = %self.room_id, "Game channel closed, dispatch loop stopping");
                    break;
                }
                LoopEvent::Team(Some(raw)) => self.handle_raw(Channel::Team, raw, &failures).await,
                LoopEvent::Team(None) => {
                    warn!(room = %self.room_id, "Team channel closed");
                    team = None;
                }
                LoopEvent::AttachTeam(subscription) => {
                    debug!(room = %self.room_id, "Team channel attached");
                    team = Some(subscription);
                }
            }
        }
    }

    async fn handle_raw(&self, channel: Channel, raw: String, failures: &mpsc::Sender<DispatchFailure>) {
        #[cfg(feature = "debug-tracing")]
        debug!(?channel, %raw, "Inbound message");

        if let Err(error) = self.dispatch(&raw).await {
            error!(?channel, %error, "Dispatch failed");
            if failures.try_send(DispatchFailure { channel, raw, error }).is_err() {
                warn!("Dispatch failure not reported, receiver full or gone");
            }
        }
    }

    /// Decode and dispatch one raw message.
    ///
    /// Unknown or malformed messages fail without touching session state.
    pub async fn dispatch(&self, raw: &str) -> Result<Dispatched, SessionError> {
        let message = InboundMessage::from_json(raw)?;
        self.dispatch_message(message).await
    }

    /// Dispatch an already decoded message through the initialization barrier.
    ///
    /// Fails, without touching state, when the barrier queue is full.
    pub async fn dispatch_message(&self, message: InboundMessage) -> Result<Dispatched, SessionError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let kind = message.kind();
        match inner.barrier.admit(message) {
            Admission::Stalled => {
                debug!(kind, stalled = inner.barrier.stalled_len(), "Held until initialization");
                Ok(Dispatched::Stalled)
            }
            Admission::Overflow(_) => Err(SessionError::InitQueueFull {
                kind,
                capacity: inner.barrier.capacity(),
            }),
            Admission::Deliver(message) => {
                let bootstrap = message.is_bootstrap();
                self.apply(&mut inner.state, message);

                if bootstrap {
                    let replay = inner.barrier.open();
                    if !replay.is_empty() {
                        info!(count = replay.len(), "Replaying messages received before initialization");
                    }
                    for message in replay {
                        self.apply(&mut inner.state, message);
                    }
                }
                Ok(Dispatched::Applied)
            }
        }
    }

    fn apply(&self, state: &mut GameState, message: InboundMessage) {
        let now = Utc::now();

        match message {
            InboundMessage::GameStart => {
                state.mark_started(now);
                info!(room = %self.room_id, "Game started");
            }
            InboundMessage::GameInfo(info) => {
                let roster = self.collaborators.roster.joined_players();
                state.bootstrap(
                    info.current_phase,
                    info.fox_team.into_setup(),
                    info.racoon_team.into_setup(),
                    &roster,
                );
                info!(
                    room = %self.room_id,
                    phase = %state.phase(),
                    players = state.players().count(),
                    "Session initialized"
                );
            }
            InboundMessage::RoundChange(change) => {
                state.set_round(RoundInfo {
                    current: change.next_round,
                    total: change.total_round,
                });
                info!(round = change.next_round, total = change.total_round, "Round changed");
            }
            InboundMessage::PhaseChange(change) => {
                let duration = change.duration();
                let (effect, updates) = state.apply_phase_change(change.phase, duration, now);
                for (sprite, visible) in updates {
                    self.collaborators.visibility.set_visible(sprite, visible);
                }
                if change.phase.is_announced() {
                    self.collaborators.notifier.phase_changed(change.phase, duration);
                }
                info!(phase = %change.phase, ?duration, ?effect, "Phase changed");
            }
            InboundMessage::GameEnd => {
                state.finish(now);
                info!(room = %self.room_id, "Game ended");
            }
            InboundMessage::Interaction { request_id, result } => {
                self.apply_interaction(state, request_id, result);
            }
            InboundMessage::Elimination(target) => {
                if state.mark_eliminated(&target.player_id) {
                    info!(player = %target.player_id, "Player eliminated");
                } else {
                    warn!(player = %target.player_id, "Elimination for unknown player");
                }
            }
            InboundMessage::PlayerDisconnected(target) => {
                if state.mark_disconnected(&target.player_id) {
                    info!(player = %target.player_id, "Player disconnected");
                } else {
                    warn!(player = %target.player_id, "Disconnect for unknown player");
                }
            }
            InboundMessage::SafeZoneUpdate(zone) => {
                debug!(?zone, "Safe zone updated");
                state.set_safe_zone(zone);
            }
            InboundMessage::SharePosition(share) => {
                state.set_position(&share.player_id, share.position);
            }
            InboundMessage::CoverScreen => state.set_screen_covered(true),
            InboundMessage::UncoverScreen => state.set_screen_covered(false),
            InboundMessage::Freeze => {
                if !state.set_local_can_move(false) {
                    debug!("FREEZE before local player is known");
                }
            }
            InboundMessage::Unfreeze => {
                if !state.set_local_can_move(true) {
                    debug!("UNFREEZE before local player is known");
                }
            }
        }
    }

    fn apply_interaction(&self, state: &mut GameState, request_id: Option<RequestId>, result: InteractionResult) {
        let subject = result.info.player_id.clone();

        // Our own outcome goes to the waiting caller, who applies it. If the
        // caller gave up (timeout, drop) the late result is applied here.
        let result = if state.is_me(&subject) {
            let Some(id) = request_id else {
                warn!(kind = result.kind.as_str(), "Own result without request id");
                return;
            };
            match self.correlator.resolve(&id, result) {
                Resolution::Delivered => return,
                Resolution::Unknown => {
                    debug!(request_id = %id, "Own result already handled");
                    return;
                }
                Resolution::Abandoned(result) => {
                    info!(request_id = %id, kind = result.kind.as_str(), "Applying late result");
                    result
                }
            }
        } else {
            result
        };

        match result.kind {
            InteractionKind::SeekSuccess | InteractionKind::SeekFail => {
                let found = result.found_player();
                state.apply_seek_result(&subject, found, result.info.catch_count);
                match found {
                    Some(found) => info!(seeker = %subject, %found, "Player found"),
                    None => debug!(seeker = %subject, "Seek missed"),
                }
            }
            InteractionKind::HideSuccess | InteractionKind::HideFail => {
                debug!(
                    player = %subject,
                    object = ?result.info.object_id,
                    succeeded = result.kind.is_success(),
                    "Hide result"
                );
            }
        }
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Set the local identity and subscribe to the team channel.
    ///
    /// Waits (at most the request timeout) for the bootstrap message.
    /// A second call is rejected.
    #[instrument(skip(self, init), fields(player = %init.player_id, team = %init.team))]
    pub async fn initialize_player(&self, init: PlayerInit) -> Result<(), SessionError> {
        if self.player_claimed.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyInitialized);
        }

        let subscription = match self.prepare_team_channel(&init.team_destination).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.player_claimed.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        {
            let mut inner = self.inner.write().await;
            inner.state.init_local_player(init.player_id.clone(), init.team, init.position)?;
        }

        self.team_tx
            .send(subscription)
            .map_err(|_| SessionError::DispatchStopped)?;
        info!(destination = %init.team_destination, "Local player initialized");
        Ok(())
    }

    async fn prepare_team_channel(&self, destination: &str) -> Result<Subscription, SessionError> {
        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, self.wait_initialized()).await {
            Ok(true) => {}
            Ok(false) => return Err(SessionError::DispatchStopped),
            Err(_) => return Err(SessionError::InitializationTimedOut(timeout)),
        }
        Ok(self.transport.get()?.subscribe(destination)?)
    }

    /// Share the local position with the team. Fire-and-forget.
    pub fn set_my_position(&self, position: &Position) -> Result<(), SessionError> {
        let body = serde_json::to_string(position)?;
        self.transport.get()?.publish(&self.destinations.share_position, body)?;
        Ok(())
    }

    /// Try to hide in `object_id` and wait for the verdict.
    #[instrument(skip(self))]
    pub async fn request_hide(&self, object_id: &str) -> Result<InteractionReply, SessionError> {
        let result = self.interact(&self.destinations.hide, object_id).await?;
        if result.kind.is_seek() {
            return Err(SessionError::UnexpectedResponse {
                expected: "hide",
                got: result.kind.as_str(),
            });
        }
        Ok(InteractionReply { is_succeeded: result.kind.is_success() })
    }

    /// Search `object_id`, wait for the verdict and apply it locally.
    #[instrument(skip(self))]
    pub async fn request_seek(&self, object_id: &str) -> Result<InteractionReply, SessionError> {
        let result = self.interact(&self.destinations.seek, object_id).await?;
        if !result.kind.is_seek() {
            return Err(SessionError::UnexpectedResponse {
                expected: "seek",
                got: result.kind.as_str(),
            });
        }

        let found = result.found_player();
        let mut inner = self.inner.write().await;
        inner
            .state
            .apply_seek_result(&result.info.player_id, found, result.info.catch_count);
        if let Some(found) = found {
            info!(%found, catch_count = result.info.catch_count, "Found a hider");
        }

        Ok(InteractionReply { is_succeeded: result.kind.is_success() })
    }

    async fn interact(&self, destination: &str, object_id: &str) -> Result<InteractionResult, SessionError> {
        if self.inner.read().await.state.me_id().is_none() {
            return Err(SessionError::PlayerNotInitialized);
        }

        let transport = self.transport.get()?;
        let pending = self.correlator.register();
        let command = InteractCommand::new(pending.id().clone(), object_id);
        transport.publish(destination, command.to_json()?)?;
        debug!(request_id = %pending.id(), %destination, "Command sent");

        Ok(pending.wait(self.config.request_timeout).await?)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Room identifier.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Has the bootstrap message been applied?
    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    /// Wait for the bootstrap message. False if the session went away first.
    pub async fn wait_initialized(&self) -> bool {
        wait_open(self.initialized.clone()).await
    }

    /// Hide/seek commands still waiting for a result.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Read access to the whole state.
    pub async fn state(&self) -> RwLockReadGuard<'_, GameState> {
        RwLockReadGuard::map(self.inner.read().await, |inner| &inner.state)
    }

    /// Copy of the whole state.
    pub async fn snapshot(&self) -> GameState {
        self.state().await.clone()
    }

    /// Current phase.
    pub async fn phase(&self) -> Phase {
        self.state().await.phase()
    }

    /// Both teams.
    pub async fn teams(&self) -> Option<Teams> {
        self.state().await.teams().cloned()
    }

    /// Team hiding this round.
    pub async fn hiding_team(&self) -> Option<Team> {
        self.state().await.hiding_team().cloned()
    }

    /// Team seeking this round.
    pub async fn seeking_team(&self) -> Option<Team> {
        self.state().await.seeking_team().cloned()
    }

    /// All players.
    pub async fn players(&self) -> Vec<Player> {
        self.state().await.players().cloned().collect()
    }

    /// Player by id.
    pub async fn player(&self, id: &PlayerId) -> Option<Player> {
        self.state().await.player(id).cloned()
    }

    /// Local player.
    pub async fn me(&self) -> Option<Player> {
        self.state().await.me().cloned()
    }

    /// Latest safe zone.
    pub async fn safe_zone(&self) -> Option<SafeZone> {
        self.state().await.safe_zone()
    }

    /// Deadline of the current phase.
    pub async fn next_phase_change_at(&self) -> Option<DateTime<Utc>> {
        self.state().await.next_phase_change_at()
    }

    /// Length of the current phase.
    pub async fn phase_duration(&self) -> Option<Duration> {
        self.state().await.phase_duration()
    }

    /// Round counter.
    pub async fn round(&self) -> Option<RoundInfo> {
        self.state().await.round()
    }

    /// When the game started.
    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state().await.started_at()
    }
}

async fn recv_optional(subscription: &mut Option<Subscription>) -> Option<String> {
    match subscription {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Inbound message could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// State mutation rejected.
    #[error(transparent)]
    State(#[from] StateError),

    /// Transport unavailable or refused.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Outbound command could not be encoded.
    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    /// No result for a hide/seek command in time.
    #[error("Request {id} timed out after {timeout:?}")]
    RequestTimedOut {
        /// Correlation id.
        id: RequestId,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// Pending request removed before its result arrived.
    #[error("Request {0} was cancelled")]
    RequestCancelled(RequestId),

    /// Too many messages before the bootstrap.
    #[error("{kind} dropped, {capacity} messages already waiting for initialization")]
    InitQueueFull {
        /// Type of the refused message.
        kind: &'static str,
        /// Queue capacity.
        capacity: usize,
    },

    /// Bootstrap message did not arrive in time.
    #[error("Session not initialized within {0:?}")]
    InitializationTimedOut(Duration),

    /// `initialize_player` already called.
    #[error("Local player already initialized")]
    AlreadyInitialized,

    /// Command needs the local identity.
    #[error("Local player not initialized")]
    PlayerNotInitialized,

    /// Result type does not match the command.
    #[error("Expected a {expected} result, got {got}")]
    UnexpectedResponse {
        /// Command sent.
        expected: &'static str,
        /// Result received.
        got: &'static str,
    },

    /// `spawn` already called.
    #[error("Dispatch loop already running")]
    AlreadyRunning,

    /// Dispatch loop is gone.
    #[error("Dispatch loop stopped")]
    DispatchStopped,
}

impl From<CorrelatorError> for SessionError {
    fn from(e: CorrelatorError) -> Self {
        match e {
            CorrelatorError::TimedOut { id, timeout } => SessionError::RequestTimedOut { id, timeout },
            CorrelatorError::Cancelled(id) => SessionError::RequestCancelled(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    use crate::game::hooks::{PhaseNotice, RosterEntry, VisibilityRegistry};
    use crate::game::player::SpriteId;
    use crate::game::team::TeamCharacter;
    use crate::network::transport::Transport;

    const GAME: &str = "/topic/rooms/7/game";
    const TEAM: &str = "/topic/rooms/7/game/racoon";

    #[derive(Default)]
    struct MockTransport {
        published: Mutex<Vec<(String, String)>>,
        subscribers: Mutex<HashMap<String, mpsc::Sender<String>>>,
    }

    impl MockTransport {
        fn published(&self) -> Vec<(String, String)> {
            self.published.lock().unwrap().clone()
        }

        fn is_subscribed(&self, destination: &str) -> bool {
            self.subscribers.lock().unwrap().contains_key(destination)
        }

        async fn deliver(&self, destination: &str, body: String) {
            let tx = self.subscribers.lock().unwrap().get(destination).cloned().unwrap();
            tx.send(body).await.unwrap();
        }
    }

    impl Transport for MockTransport {
        fn subscribe(&self, destination: &str) -> Result<Subscription, TransportError> {
            let (tx, rx) = mpsc::channel(64);
            self.subscribers.lock().unwrap().insert(destination.to_string(), tx);
            Ok(rx)
        }

        fn publish(&self, destination: &str, body: String) -> Result<(), TransportError> {
            self.published.lock().unwrap().push((destination.to_string(), body));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingVisibility {
        calls: Mutex<Vec<(SpriteId, bool)>>,
    }

    impl VisibilityRegistry for RecordingVisibility {
        fn set_visible(&self, sprite: SpriteId, visible: bool) {
            self.calls.lock().unwrap().push((sprite, visible));
        }
    }

    struct Harness {
        session: Arc<GameSession>,
        transport: Arc<MockTransport>,
        sprites: Arc<RecordingVisibility>,
        notices: mpsc::UnboundedReceiver<PhaseNotice>,
    }

    /// Racoon (a1, a2) hides, fox (b1, b2) seeks. Sprites 0..=3 in that order.
    fn roster() -> Vec<RosterEntry> {
        ["a1", "a2", "b1", "b2"]
            .iter()
            .enumerate()
            .map(|(i, id)| RosterEntry {
                id: PlayerId::new(*id),
                nickname: format!("nick-{id}"),
                sprite: Some(SpriteId(i as u64)),
            })
            .collect()
    }

    fn harness(config: SessionConfig) -> Harness {
        let transport = Arc::new(MockTransport::default());
        let sprites = Arc::new(RecordingVisibility::default());
        let (notice_tx, notices) = mpsc::unbounded_channel();

        let collaborators = Collaborators {
            roster: Arc::new(roster()),
            visibility: sprites.clone(),
            notifier: Arc::new(notice_tx),
        };
        let session = GameSession::new(
            "7",
            GAME,
            TransportHandle::ready_with(transport.clone()),
            collaborators,
            config,
        );

        Harness {
            session: Arc::new(session),
            transport,
            sprites,
            notices,
        }
    }

    fn message(kind: &str, data: Value) -> String {
        json!({ "type": kind, "data": data }).to_string()
    }

    fn reply(kind: &str, request_id: &str, data: Value) -> String {
        json!({ "type": kind, "requestId": request_id, "data": data }).to_string()
    }

    fn game_info() -> String {
        message(
            "GAME_INFO",
            json!({
                "currentPhase": "INITIALIZED",
                "foxTeam": {"isHidingTeam": false, "players": [{"playerId": "b1"}, {"playerId": "b2"}]},
                "racoonTeam": {"isHidingTeam": true, "players": [{"playerId": "a1"}, {"playerId": "a2"}]}
            }),
        )
    }

    fn phase_change(phase: &str, millis: u64) -> String {
        message("PHASE_CHANGE", json!({ "phase": phase, "finishAfterMilliSec": millis }))
    }

    fn init(player: &str, team: TeamCharacter) -> PlayerInit {
        PlayerInit {
            player_id: PlayerId::new(player),
            team,
            position: Position::new(100.0, 200.0, "down"),
            team_destination: TEAM.to_string(),
        }
    }

    async fn bootstrapped_as(h: &Harness, player: &str, team: TeamCharacter) {
        h.session.dispatch(&game_info()).await.unwrap();
        h.session.initialize_player(init(player, team)).await.unwrap();
    }

    /// Request id of the `n`th published command, once it has been sent.
    async fn published_request_id(transport: &MockTransport, n: usize) -> String {
        loop {
            if let Some((_, body)) = transport.published().get(n) {
                let value: Value = serde_json::from_str(body).unwrap();
                return value["requestId"].as_str().unwrap().to_string();
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_messages_before_bootstrap_replay_in_order() {
        let h = harness(SessionConfig::default());

        let early = [
            phase_change("READY", 1000),
            message("SAFE_ZONE_UPDATE", json!([0, 0, 100, 100])),
            phase_change("MAIN", 2000),
            message("SAFE_ZONE_UPDATE", json!([10, 10, 90, 90])),
        ];
        for raw in &early {
            assert_eq!(h.session.dispatch(raw).await.unwrap(), Dispatched::Stalled);
        }
        assert_eq!(h.session.phase().await, Phase::Initializing);
        assert!(h.session.safe_zone().await.is_none());
        assert!(!h.session.is_initialized());

        assert_eq!(h.session.dispatch(&game_info()).await.unwrap(), Dispatched::Applied);

        assert!(h.session.is_initialized());
        assert_eq!(h.session.phase().await, Phase::Main);
        assert_eq!(h.session.phase_duration().await, Some(Duration::from_millis(2000)));
        let zone = h.session.safe_zone().await.unwrap();
        assert_eq!((zone.left, zone.right), (10.0, 90.0));
    }

    #[tokio::test]
    async fn test_full_init_queue_reports_and_keeps_earlier() {
        let config = SessionConfig {
            max_stalled_messages: 2,
            ..SessionConfig::default()
        };
        let h = harness(config);

        h.session.dispatch(&phase_change("READY", 1000)).await.unwrap();
        h.session.dispatch(&phase_change("MAIN", 2000)).await.unwrap();
        let err = h.session.dispatch(&phase_change("END", 3000)).await.unwrap_err();
        assert!(matches!(err, SessionError::InitQueueFull { kind: "PHASE_CHANGE", capacity: 2 }));

        h.session.dispatch(&game_info()).await.unwrap();
        assert_eq!(h.session.phase().await, Phase::Main);
        assert!(h.session.teams().await.unwrap().racoon().is_hiding_team());
    }

    #[tokio::test]
    async fn test_dispatch_loop_reports_full_init_queue() {
        let config = SessionConfig {
            max_stalled_messages: 1,
            ..SessionConfig::default()
        };
        let h = harness(config);
        let (handle, mut failures) = h.session.spawn().unwrap();
        while !h.transport.is_subscribed(GAME) {
            tokio::task::yield_now().await;
        }

        h.transport.deliver(GAME, message("FREEZE", Value::Null)).await;
        h.transport.deliver(GAME, message("UNFREEZE", Value::Null)).await;

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.channel, Channel::Game);
        assert!(failure.raw.contains("UNFREEZE"));
        assert!(matches!(failure.error, SessionError::InitQueueFull { kind: "UNFREEZE", capacity: 1 }));

        handle.abort();
    }

    #[tokio::test]
    async fn test_ready_then_end_scenario() {
        let mut h = harness(SessionConfig::default());
        bootstrapped_as(&h, "a1", TeamCharacter::Racoon).await;

        let before = Utc::now();
        h.session.dispatch(&phase_change("READY", 5000)).await.unwrap();
        let after = Utc::now();

        for id in ["a2", "b1", "b2"] {
            assert!(h.session.player(&PlayerId::new(id)).await.unwrap().visible, "{id}");
        }
        let calls = h.sprites.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(sprite, visible)| *visible && *sprite != SpriteId(0)));

        let deadline = h.session.next_phase_change_at().await.unwrap();
        assert!(deadline >= before + chrono::Duration::milliseconds(5000));
        assert!(deadline <= after + chrono::Duration::milliseconds(5000));
        assert_eq!(
            h.notices.try_recv().unwrap(),
            PhaseNotice { phase: Phase::Ready, duration: Duration::from_millis(5000) }
        );

        h.session.dispatch(&phase_change("END", 3000)).await.unwrap();
        let teams = h.session.teams().await.unwrap();
        assert!(!teams.racoon().is_hiding_team());
        assert!(teams.fox().is_hiding_team());
        assert!(h.notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_main_phase_hides_hiders_from_seeker() {
        let h = harness(SessionConfig::default());
        bootstrapped_as(&h, "b1", TeamCharacter::Fox).await;

        h.session.dispatch(&phase_change("MAIN", 60_000)).await.unwrap();

        assert!(!h.session.player(&PlayerId::new("a1")).await.unwrap().visible);
        assert!(!h.session.player(&PlayerId::new("a2")).await.unwrap().visible);
        assert!(h.session.player(&PlayerId::new("b2")).await.unwrap().visible);
    }

    #[tokio::test]
    async fn test_unknown_type_leaves_state_unchanged() {
        let h = harness(SessionConfig::default());
        bootstrapped_as(&h, "a1", TeamCharacter::Racoon).await;

        let phase = h.session.phase().await;
        let teams = h.session.teams().await;
        let players = h.session.players().await;

        let err = h.session.dispatch(r#"{"type":"NOT_A_REAL_TYPE","data":{}}"#).await.unwrap_err();
        assert!(matches!(err, SessionError::Protocol(ProtocolError::UnknownMessageType(ref t)) if t == "NOT_A_REAL_TYPE"));

        assert_eq!(h.session.phase().await, phase);
        assert_eq!(h.session.teams().await, teams);
        assert_eq!(h.session.players().await, players);
    }

    #[tokio::test]
    async fn test_request_hide_success_and_fail() {
        let h = harness(SessionConfig::default());
        bootstrapped_as(&h, "a1", TeamCharacter::Racoon).await;

        let session = h.session.clone();
        let task = tokio::spawn(async move { session.request_hide("bush-1").await });
        let id = published_request_id(&h.transport, 0).await;
        assert_eq!(h.transport.published()[0].0, "/ws/rooms/7/game/hide");

        h.session
            .dispatch(&reply("INTERACT_HIDE_SUCCESS", &id, json!({"playerId": "a1", "objectId": "bush-1"})))
            .await
            .unwrap();
        assert_eq!(task.await.unwrap().unwrap(), InteractionReply { is_succeeded: true });

        let session = h.session.clone();
        let task = tokio::spawn(async move { session.request_hide("bush-2").await });
        let id = published_request_id(&h.transport, 1).await;
        h.session
            .dispatch(&reply("INTERACT_HIDE_FAIL", &id, json!({"playerId": "a1", "objectId": "bush-2"})))
            .await
            .unwrap();
        assert_eq!(task.await.unwrap().unwrap(), InteractionReply { is_succeeded: false });
        assert_eq!(h.session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_results_for_other_players_do_not_resolve() {
        let config = SessionConfig {
            request_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let h = harness(config);
        bootstrapped_as(&h, "a1", TeamCharacter::Racoon).await;

        let session = h.session.clone();
        let task = tokio::spawn(async move { session.request_hide("bush-1").await });
        let id = published_request_id(&h.transport, 0).await;

        h.session
            .dispatch(&reply("INTERACT_HIDE_SUCCESS", &id, json!({"playerId": "a2", "objectId": "bush-1"})))
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::RequestTimedOut { .. }));
        assert_eq!(h.session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_seek_fail_updates_rest_count() {
        let config = SessionConfig {
            max_seek_count: 3,
            ..SessionConfig::default()
        };
        let h = harness(config);
        bootstrapped_as(&h, "b1", TeamCharacter::Fox).await;

        let session = h.session.clone();
        let task = tokio::spawn(async move { session.request_seek("tree-4").await });
        let id = published_request_id(&h.transport, 0).await;
        assert_eq!(h.transport.published()[0].0, "/ws/rooms/7/game/seek");

        // The server fills foundPlayerId with a placeholder on a miss.
        let miss = json!({"playerId": "b1", "objectId": "tree-4", "foundPlayerId": "NONE", "catchCount": 2});
        h.session.dispatch(&reply("INTERACT_SEEK_FAIL", &id, miss)).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), InteractionReply { is_succeeded: false });
        let me = h.session.me().await.unwrap();
        assert_eq!(me.rest_seek_count, 1);
        assert_eq!(me.catch_count, 0);
    }

    #[tokio::test]
    async fn test_other_players_seek_miss_is_not_a_catch() {
        let h = harness(SessionConfig::default());
        bootstrapped_as(&h, "a1", TeamCharacter::Racoon).await;

        let broadcast = message(
            "INTERACT_SEEK_FAIL",
            json!({"playerId": "b2", "objectId": "tree-1", "foundPlayerId": "NONE", "catchCount": 3}),
        );
        h.session.dispatch(&broadcast).await.unwrap();

        let seeker = h.session.player(&PlayerId::new("b2")).await.unwrap();
        assert_eq!(seeker.catch_count, 0);
        assert_eq!(seeker.rest_seek_count, 2);
        assert!(h.session.players().await.iter().all(|p| p.alive));
    }

    #[tokio::test]
    async fn test_late_own_seek_result_applied_after_timeout() {
        let config = SessionConfig {
            request_timeout: Duration::from_millis(30),
            ..SessionConfig::default()
        };
        let h = harness(config);
        bootstrapped_as(&h, "b1", TeamCharacter::Fox).await;

        let session = h.session.clone();
        let task = tokio::spawn(async move { session.request_seek("tree-4").await });
        let id = published_request_id(&h.transport, 0).await;
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::RequestTimedOut { .. }));

        let late = reply(
            "INTERACT_SEEK_SUCCESS",
            &id,
            json!({"playerId": "b1", "objectId": "tree-4", "foundPlayerId": "a2", "catchCount": 1}),
        );
        h.session.dispatch(&late).await.unwrap();

        assert!(!h.session.player(&PlayerId::new("a2")).await.unwrap().alive);
        let me = h.session.me().await.unwrap();
        assert_eq!(me.catch_count, 1);
        assert_eq!(me.rest_seek_count, 4);

        // A repeat of the late result is not counted again.
        h.session.dispatch(&late).await.unwrap();
        assert_eq!(h.session.me().await.unwrap().catch_count, 1);
    }

    #[tokio::test]
    async fn test_own_seek_success_applied_once() {
        let h = harness(SessionConfig::default());
        bootstrapped_as(&h, "b1", TeamCharacter::Fox).await;

        let session = h.session.clone();
        let task = tokio::spawn(async move { session.request_seek("tree-4").await });
        let id = published_request_id(&h.transport, 0).await;

        let result = reply(
            "INTERACT_SEEK_SUCCESS",
            &id,
            json!({"playerId": "b1", "objectId": "tree-4", "foundPlayerId": "a2", "catchCount": 1}),
        );
        h.session.dispatch(&result).await.unwrap();
        assert!(task.await.unwrap().unwrap().is_succeeded);

        // Same broadcast again: nothing waits for it and it must not count twice.
        h.session.dispatch(&result).await.unwrap();

        let me = h.session.me().await.unwrap();
        assert_eq!(me.catch_count, 1);
        assert_eq!(me.rest_seek_count, 4);
        assert!(!h.session.player(&PlayerId::new("a2")).await.unwrap().alive);
    }

    #[tokio::test]
    async fn test_other_players_seek_broadcast_applied() {
        let h = harness(SessionConfig::default());
        bootstrapped_as(&h, "a1", TeamCharacter::Racoon).await;

        let broadcast = message(
            "INTERACT_SEEK_SUCCESS",
            json!({"playerId": "b2", "objectId": "tree-1", "foundPlayerId": "a2", "catchCount": 1}),
        );
        h.session.dispatch(&broadcast).await.unwrap();

        assert!(!h.session.player(&PlayerId::new("a2")).await.unwrap().alive);
        let seeker = h.session.player(&PlayerId::new("b2")).await.unwrap();
        assert_eq!(seeker.catch_count, 1);
        assert_eq!(seeker.rest_seek_count, 4);
        assert!(h.session.me().await.unwrap().alive);
    }

    #[tokio::test]
    async fn test_share_position_updates_me_and_others() {
        let h = harness(SessionConfig::default());
        bootstrapped_as(&h, "a1", TeamCharacter::Racoon).await;

        for (id, x) in [("a1", 5.0), ("a2", 7.0)] {
            let raw = message("SHARE_POSITION", json!({"playerId": id, "x": x, "y": 1.0, "direction": "left"}));
            h.session.dispatch(&raw).await.unwrap();
        }

        assert_eq!(h.session.me().await.unwrap().position, Position::new(5.0, 1.0, "left"));
        assert_eq!(
            h.session.player(&PlayerId::new("a2")).await.unwrap().position,
            Position::new(7.0, 1.0, "left")
        );
    }

    #[tokio::test]
    async fn test_initialize_player_waits_for_bootstrap() {
        let h = harness(SessionConfig::default());

        let session = h.session.clone();
        let task = tokio::spawn(async move { session.initialize_player(init("a1", TeamCharacter::Racoon)).await });
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        h.session.dispatch(&game_info()).await.unwrap();
        task.await.unwrap().unwrap();

        let me = h.session.me().await.unwrap();
        assert_eq!(me.id, PlayerId::new("a1"));
        assert_eq!(me.position, Position::new(100.0, 200.0, "down"));
        assert!(h.transport.is_subscribed(TEAM));
    }

    #[tokio::test]
    async fn test_initialize_player_rejected_twice() {
        let h = harness(SessionConfig::default());
        bootstrapped_as(&h, "a1", TeamCharacter::Racoon).await;

        let err = h.session.initialize_player(init("a2", TeamCharacter::Racoon)).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyInitialized));
        assert_eq!(h.session.me().await.unwrap().id, PlayerId::new("a1"));
    }

    #[tokio::test]
    async fn test_initialize_player_times_out_without_bootstrap() {
        let config = SessionConfig {
            request_timeout: Duration::from_millis(20),
            ..SessionConfig::default()
        };
        let h = harness(config);

        let err = h.session.initialize_player(init("a1", TeamCharacter::Racoon)).await.unwrap_err();
        assert!(matches!(err, SessionError::InitializationTimedOut(_)));

        // A failed attempt does not use up the single call.
        h.session.dispatch(&game_info()).await.unwrap();
        h.session.initialize_player(init("a1", TeamCharacter::Racoon)).await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_need_local_player() {
        let h = harness(SessionConfig::default());
        h.session.dispatch(&game_info()).await.unwrap();

        let err = h.session.request_hide("bush-1").await.unwrap_err();
        assert!(matches!(err, SessionError::PlayerNotInitialized));
        assert!(h.transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_set_my_position_publishes() {
        let h = harness(SessionConfig::default());
        h.session.set_my_position(&Position::new(3.0, 4.0, "up")).unwrap();

        let published = h.transport.published();
        assert_eq!(published[0].0, "/ws/rooms/7/game/share-position");
        let body: Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(body, json!({"x": 3.0, "y": 4.0, "direction": "up"}));
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let h = harness(SessionConfig::default());
        bootstrapped_as(&h, "a1", TeamCharacter::Racoon).await;

        h.session.dispatch(&message("GAME_START", Value::Null)).await.unwrap();
        h.session.dispatch(&message("ROUND_CHANGE", json!({"nextRound": 2, "totalRound": 3}))).await.unwrap();
        h.session.dispatch(&message("ELIMINATION", json!({"playerId": "a2"}))).await.unwrap();
        h.session.dispatch(&message("PLAYER_DISCONNECTED", json!({"playerId": "b2"}))).await.unwrap();
        h.session.dispatch(&message("COVER_SCREEN", Value::Null)).await.unwrap();
        h.session.dispatch(&message("FREEZE", Value::Null)).await.unwrap();

        let state = h.session.snapshot().await;
        assert!(state.started_at().is_some());
        assert_eq!(state.round(), Some(RoundInfo { current: 2, total: 3 }));
        assert!(!state.player(&PlayerId::new("a2")).unwrap().alive);
        assert!(!state.player(&PlayerId::new("b2")).unwrap().connected);
        assert!(state.is_screen_covered());
        assert!(!state.me().unwrap().can_move);

        h.session.dispatch(&message("UNCOVER_SCREEN", Value::Null)).await.unwrap();
        h.session.dispatch(&message("UNFREEZE", Value::Null)).await.unwrap();
        h.session.dispatch(&message("GAME_END", Value::Null)).await.unwrap();

        let state = h.session.state().await;
        assert!(!state.is_screen_covered());
        assert!(state.me().unwrap().can_move);
        assert_eq!(state.phase(), Phase::Finished);
        assert!(state.ended_at().is_some());
    }

    #[tokio::test]
    async fn test_dispatch_loop_end_to_end() {
        let h = harness(SessionConfig::default());
        let (handle, mut failures) = h.session.spawn().unwrap();
        assert!(matches!(h.session.spawn(), Err(SessionError::AlreadyRunning)));

        while !h.transport.is_subscribed(GAME) {
            tokio::task::yield_now().await;
        }

        h.transport.deliver(GAME, message("FREEZE", Value::Null)).await;
        h.transport.deliver(GAME, game_info()).await;
        h.transport.deliver(GAME, r#"{"type":"NOT_A_REAL_TYPE"}"#.to_string()).await;

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.channel, Channel::Game);
        assert!(matches!(failure.error, SessionError::Protocol(ProtocolError::UnknownMessageType(_))));
        assert!(h.session.is_initialized());

        h.session.initialize_player(init("a1", TeamCharacter::Racoon)).await.unwrap();
        h.transport.deliver(TEAM, message("FREEZE", Value::Null)).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while h.session.me().await.unwrap().can_move {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        handle.abort();
    }

    proptest! {
        #[test]
        fn prop_early_messages_apply_in_arrival_order(
            sequence in proptest::collection::vec((0u8..3, 1u32..1000), 1..30),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let h = harness(SessionConfig::default());
                for &(pick, n) in &sequence {
                    let raw = match pick {
                        0 => message("ROUND_CHANGE", json!({"nextRound": n, "totalRound": 1000})),
                        1 => message("SAFE_ZONE_UPDATE", json!([n, 0, 2000, 2000])),
                        _ => phase_change("MAIN", u64::from(n)),
                    };
                    assert_eq!(h.session.dispatch(&raw).await.unwrap(), Dispatched::Stalled);
                }
                h.session.dispatch(&game_info()).await.unwrap();

                // Replay in arrival order means the last of each kind wins.
                let last = |kind: u8| sequence.iter().rev().find(|(pick, _)| *pick == kind).map(|&(_, n)| n);
                let state = h.session.snapshot().await;
                assert_eq!(state.round().map(|r| r.current), last(0));
                assert_eq!(state.safe_zone().map(|z| z.left as u32), last(1));
                match last(2) {
                    Some(n) => {
                        assert_eq!(state.phase(), Phase::Main);
                        assert_eq!(state.phase_duration(), Some(Duration::from_millis(u64::from(n))));
                    }
                    None => assert_eq!(state.phase(), Phase::Initialized),
                }
            });
        }
    }
}
