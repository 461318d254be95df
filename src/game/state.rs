//! Session State
//!
//! Canonical local view of a game session: phase, teams, players and the
//! safe zone. Everything here is synchronous and free of I/O; the
//! [`GameSession`](crate::network::session::GameSession) owns one
//! `GameState` and is its only writer.
//!
//! Mutators return the sprite visibility changes they imply instead of
//! calling the renderer themselves, so state transitions stay testable.

use std::collections::BTreeMap;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::game::hooks::RosterEntry;
use crate::game::phase::{Phase, PhaseEffect};
use crate::game::player::{Player, PlayerId, Position, SpriteId};
use crate::game::team::{Role, Team, TeamCharacter};

// =============================================================================
// SAFE ZONE
// =============================================================================

/// Current playable rectangle, shrunk over time by the server.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "SafeZoneRepr")]
pub struct SafeZone {
    /// Left edge
    pub left: f64,
    /// Top edge
    pub top: f64,
    /// Right edge
    pub right: f64,
    /// Bottom edge
    pub bottom: f64,
}

/// The server sends `[left, top, right, bottom]`; the named form is accepted too.
#[derive(Deserialize)]
#[serde(untagged)]
enum SafeZoneRepr {
    Corners([f64; 4]),
    Named { left: f64, top: f64, right: f64, bottom: f64 },
}

impl From<SafeZoneRepr> for SafeZone {
    fn from(repr: SafeZoneRepr) -> Self {
        match repr {
            SafeZoneRepr::Corners([left, top, right, bottom]) => Self { left, top, right, bottom },
            SafeZoneRepr::Named { left, top, right, bottom } => Self { left, top, right, bottom },
        }
    }
}

// =============================================================================
// TEAMS
// =============================================================================

/// Team membership as announced by the bootstrap message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TeamSetup {
    /// Hiding this round?
    pub is_hiding_team: bool,
    /// Members in server order, with the nickname the server knows (if any).
    pub members: Vec<(PlayerId, Option<String>)>,
}

/// The two teams of a session.
///
/// After construction exactly one of them is the hiding team.
#[derive(Clone, Debug, PartialEq)]
pub struct Teams {
    fox: Team,
    racoon: Team,
}

impl Teams {
    /// Build both teams, enforcing the complementary hiding flag.
    ///
    /// If the server reports both or neither team as hiding, the racoon
    /// team hides (it is the first hiding team on the server side).
    pub fn new(fox: Vec<PlayerId>, racoon: Vec<PlayerId>, fox_hiding: bool, racoon_hiding: bool) -> Self {
        let fox_hiding = if fox_hiding == racoon_hiding {
            warn!(fox_hiding, racoon_hiding, "Inconsistent hiding flags, racoon team hides");
            false
        } else {
            fox_hiding
        };

        Self {
            fox: Team::new(TeamCharacter::Fox, fox, fox_hiding),
            racoon: Team::new(TeamCharacter::Racoon, racoon, !fox_hiding),
        }
    }

    /// Team by slot.
    pub fn get(&self, character: TeamCharacter) -> &Team {
        match character {
            TeamCharacter::Fox => &self.fox,
            TeamCharacter::Racoon => &self.racoon,
        }
    }

    fn get_mut(&mut self, character: TeamCharacter) -> &mut Team {
        match character {
            TeamCharacter::Fox => &mut self.fox,
            TeamCharacter::Racoon => &mut self.racoon,
        }
    }

    /// Fox team.
    pub fn fox(&self) -> &Team {
        &self.fox
    }

    /// Racoon team.
    pub fn racoon(&self) -> &Team {
        &self.racoon
    }

    /// Team hiding this round.
    pub fn hiding(&self) -> &Team {
        if self.fox.is_hiding_team() { &self.fox } else { &self.racoon }
    }

    /// Team seeking this round.
    pub fn seeking(&self) -> &Team {
        if self.fox.is_hiding_team() { &self.racoon } else { &self.fox }
    }

    /// Swap roles at the end of a round.
    fn flip_roles(&mut self) {
        self.fox.flip_role();
        self.racoon.flip_role();
    }

    /// Team a player belongs to, if any.
    pub fn team_of(&self, id: &PlayerId) -> Option<TeamCharacter> {
        if self.fox.contains(id) {
            Some(TeamCharacter::Fox)
        } else if self.racoon.contains(id) {
            Some(TeamCharacter::Racoon)
        } else {
            None
        }
    }
}

/// Round counter from ROUND_CHANGE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundInfo {
    /// Round about to be played (1-based)
    pub current: u32,
    /// Rounds in the game
    pub total: u32,
}

/// Sprite visibility change to forward to the renderer.
pub type SpriteUpdate = (SpriteId, bool);

/// Errors raised by state mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// Bootstrap message not processed yet.
    #[error("Session state is not initialized")]
    NotInitialized,

    /// Local identity is set once per session.
    #[error("Local player already initialized as {0}")]
    LocalPlayerAlreadySet(PlayerId),
}

// =============================================================================
// GAME STATE
// =============================================================================

/// Complete local view of one game session.
#[derive(Clone, Debug)]
pub struct GameState {
    room_id: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    phase: Phase,
    next_phase_change_at: Option<DateTime<Utc>>,
    phase_duration: Option<Duration>,
    safe_zone: Option<SafeZone>,
    round: Option<RoundInfo>,
    screen_covered: bool,
    initialized: bool,
    teams: Option<Teams>,
    players: BTreeMap<PlayerId, Player>,
    me: Option<PlayerId>,
    max_seek_count: u32,
}

impl GameState {
    /// Fresh state for a room, in INITIALIZING.
    pub fn new(room_id: impl Into<String>, max_seek_count: u32) -> Self {
        Self {
            room_id: room_id.into(),
            started_at: None,
            ended_at: None,
            phase: Phase::Initializing,
            next_phase_change_at: None,
            phase_duration: None,
            safe_zone: None,
            round: None,
            screen_covered: false,
            initialized: false,
            teams: None,
            players: BTreeMap::new(),
            me: None,
            max_seek_count,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Room this session belongs to.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// When GAME_START arrived.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When GAME_END arrived.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Deadline of the current phase.
    pub fn next_phase_change_at(&self) -> Option<DateTime<Utc>> {
        self.next_phase_change_at
    }

    /// Length of the current phase.
    pub fn phase_duration(&self) -> Option<Duration> {
        self.phase_duration
    }

    /// Latest safe zone.
    pub fn safe_zone(&self) -> Option<SafeZone> {
        self.safe_zone
    }

    /// Round counter.
    pub fn round(&self) -> Option<RoundInfo> {
        self.round
    }

    /// Screen covered by a COVER_SCREEN command?
    pub fn is_screen_covered(&self) -> bool {
        self.screen_covered
    }

    /// Bootstrap processed?
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Both teams (after bootstrap).
    pub fn teams(&self) -> Option<&Teams> {
        self.teams.as_ref()
    }

    /// Team hiding this round.
    pub fn hiding_team(&self) -> Option<&Team> {
        self.teams.as_ref().map(Teams::hiding)
    }

    /// Team seeking this round.
    pub fn seeking_team(&self) -> Option<&Team> {
        self.teams.as_ref().map(Teams::seeking)
    }

    /// All known players, ordered by id.
    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Player by id.
    pub fn player(&self, id: &PlayerId) -> Option<&Player> {
        self.players.get(id)
    }

    /// Local identity.
    pub fn me_id(&self) -> Option<&PlayerId> {
        self.me.as_ref()
    }

    /// Local player.
    pub fn me(&self) -> Option<&Player> {
        self.me.as_ref().and_then(|id| self.players.get(id))
    }

    /// Is `id` the local identity?
    pub fn is_me(&self, id: &PlayerId) -> bool {
        self.me.as_ref() == Some(id)
    }

    /// Role of the local player's team this round.
    pub fn local_role(&self) -> Option<Role> {
        let team = self.me()?.team;
        self.teams.as_ref().map(|t| t.get(team).role())
    }

    /// Seek attempts per round.
    pub fn max_seek_count(&self) -> u32 {
        self.max_seek_count
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub(crate) fn mark_started(&mut self, now: DateTime<Utc>) {
        self.started_at = Some(now);
    }

    /// Populate teams and players from the bootstrap message.
    ///
    /// Roster entries supply nicknames and sprite handles; team data decides
    /// membership. A bootstrap phase of INITIALIZING is promoted to
    /// INITIALIZED, later phases (joining mid-game) are kept.
    pub(crate) fn bootstrap(&mut self, phase: Phase, fox: TeamSetup, racoon: TeamSetup, roster: &[RosterEntry]) {
        let roster: BTreeMap<&PlayerId, &RosterEntry> = roster.iter().map(|e| (&e.id, e)).collect();
        let previous = std::mem::take(&mut self.players);

        for (character, setup) in [(TeamCharacter::Fox, &fox), (TeamCharacter::Racoon, &racoon)] {
            for (id, nickname) in &setup.members {
                let entry = roster.get(id);
                let nickname = entry
                    .map(|e| e.nickname.clone())
                    .or_else(|| nickname.clone())
                    .unwrap_or_else(|| id.to_string());

                let mut player = Player::new(id.clone(), nickname, character, self.max_seek_count)
                    .with_sprite(entry.and_then(|e| e.sprite));
                // A repeated bootstrap keeps what we already learned about the player.
                if let Some(old) = previous.get(id) {
                    player.position = old.position.clone();
                    player.alive = old.alive;
                    player.connected = old.connected;
                    player.visible = old.visible;
                }
                self.players.insert(id.clone(), player);
            }
        }

        let ids = |setup: &TeamSetup| -> Vec<PlayerId> { setup.members.iter().map(|(id, _)| id.clone()).collect() };
        let mut teams = Teams::new(ids(&fox), ids(&racoon), fox.is_hiding_team, racoon.is_hiding_team);

        // Local player survives a repeated bootstrap.
        if let Some(me) = self.me.clone() {
            if let Some(old) = previous.get(&me) {
                if teams.team_of(&me).is_none() {
                    teams.get_mut(old.team).add_player(me.clone());
                }
                self.players.entry(me).or_insert_with(|| old.clone());
            }
        }

        self.teams = Some(teams);
        self.phase = if phase == Phase::Initializing { Phase::Initialized } else { phase };
        self.initialized = true;
    }

    /// Set the local identity. Allowed once, after bootstrap.
    pub(crate) fn init_local_player(
        &mut self,
        id: PlayerId,
        team: TeamCharacter,
        position: Position,
    ) -> Result<(), StateError> {
        if let Some(me) = &self.me {
            return Err(StateError::LocalPlayerAlreadySet(me.clone()));
        }
        let teams = self.teams.as_mut().ok_or(StateError::NotInitialized)?;

        // The server's team assignment wins over whatever bootstrap said.
        if let Some(current) = teams.team_of(&id) {
            if current != team {
                warn!(player = %id, from = %current, to = %team, "Local player moved between teams");
                teams.get_mut(current).remove_player(&id);
            }
        }
        teams.get_mut(team).add_player(id.clone());

        let max_seek_count = self.max_seek_count;
        let player = self
            .players
            .entry(id.clone())
            .or_insert_with(|| Player::new(id.clone(), "me", team, max_seek_count));
        player.team = team;
        player.set_position(position);

        self.me = Some(id);
        Ok(())
    }

    pub(crate) fn finish(&mut self, now: DateTime<Utc>) {
        self.phase = Phase::Finished;
        self.ended_at = Some(now);
    }

    // -------------------------------------------------------------------------
    // Phase
    // -------------------------------------------------------------------------

    /// Enter `phase`, lasting `duration` from `now`.
    ///
    /// Returns the effect that was applied and the sprite updates it implies.
    pub(crate) fn apply_phase_change(
        &mut self,
        phase: Phase,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> (PhaseEffect, Vec<SpriteUpdate>) {
        if !self.phase.can_transition_to(phase) {
            warn!(from = %self.phase, to = %phase, "Unexpected phase transition");
        }

        self.phase = phase;
        self.phase_duration = Some(duration);
        self.next_phase_change_at = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d));

        let effect = match phase {
            Phase::End => PhaseEffect::FlipRoles,
            _ => match self.local_role() {
                Some(role) => phase.effect(role),
                None => {
                    if phase.is_announced() {
                        warn!(%phase, "Local player unknown, visibility left unchanged");
                    }
                    PhaseEffect::None
                }
            },
        };

        let updates = match effect {
            PhaseEffect::None => Vec::new(),
            PhaseEffect::FlipRoles => {
                if let Some(teams) = self.teams.as_mut() {
                    teams.flip_roles();
                }
                Vec::new()
            }
            PhaseEffect::Visibility { seeking_visible, hiding_visible } => {
                let (seeking, hiding) = match self.teams.as_ref() {
                    Some(teams) => (teams.seeking().character, teams.hiding().character),
                    None => return (effect, Vec::new()),
                };
                let mut updates = self.set_team_visibility(seeking, seeking_visible);
                updates.extend(self.set_team_visibility(hiding, hiding_visible));
                updates
            }
        };

        (effect, updates)
    }

    /// Show or hide every member of a team except the local player.
    pub(crate) fn set_team_visibility(&mut self, character: TeamCharacter, visible: bool) -> Vec<SpriteUpdate> {
        let Some(teams) = self.teams.as_ref() else {
            return Vec::new();
        };

        let mut updates = Vec::new();
        for id in teams.get(character).players() {
            if self.me.as_ref() == Some(id) {
                continue;
            }
            if let Some(player) = self.players.get_mut(id) {
                player.visible = visible;
                if let Some(sprite) = player.sprite {
                    updates.push((sprite, visible));
                }
            }
        }
        updates
    }

    // -------------------------------------------------------------------------
    // Players
    // -------------------------------------------------------------------------

    /// Single position setter shared by the local and remote paths.
    pub(crate) fn set_position(&mut self, id: &PlayerId, position: Position) -> bool {
        match self.players.get_mut(id) {
            Some(player) => {
                player.set_position(position);
                true
            }
            None => {
                debug!(player = %id, "Position for unknown player");
                false
            }
        }
    }

    /// Apply a seek outcome to the seeker (and the found player on success).
    ///
    /// `found` is the hider caught, `None` for a miss. `catch_count` is the
    /// server's count of attempts used this round.
    pub(crate) fn apply_seek_result(&mut self, seeker: &PlayerId, found: Option<&PlayerId>, catch_count: u32) {
        let rest = self.max_seek_count.saturating_sub(catch_count);

        if let Some(found) = found {
            match self.players.get_mut(found) {
                Some(player) => player.set_dead(),
                None => warn!(player = %found, "Found player is unknown"),
            }
        }

        match self.players.get_mut(seeker) {
            Some(player) => {
                player.set_rest_seek_count(rest);
                if found.is_some() {
                    player.increase_catch_count();
                }
            }
            None => warn!(player = %seeker, "Seeking player is unknown"),
        }
    }

    pub(crate) fn mark_eliminated(&mut self, id: &PlayerId) -> bool {
        self.players.get_mut(id).map(Player::set_dead).is_some()
    }

    pub(crate) fn mark_disconnected(&mut self, id: &PlayerId) -> bool {
        self.players.get_mut(id).map(|p| p.connected = false).is_some()
    }

    /// FREEZE / UNFREEZE target the local player.
    pub(crate) fn set_local_can_move(&mut self, can_move: bool) -> bool {
        let Some(me) = self.me.as_ref() else {
            return false;
        };
        self.players.get_mut(me).map(|p| p.can_move = can_move).is_some()
    }

    // -------------------------------------------------------------------------
    // Misc
    // -------------------------------------------------------------------------

    pub(crate) fn set_safe_zone(&mut self, zone: SafeZone) {
        self.safe_zone = Some(zone);
    }

    pub(crate) fn set_round(&mut self, round: RoundInfo) {
        self.round = Some(round);
    }

    pub(crate) fn set_screen_covered(&mut self, covered: bool) {
        self.screen_covered = covered;
    }
}
