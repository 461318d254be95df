//! Player Model
//!
//! Identity, position and status of a single participant.
//! Players are plain values owned by [`GameState`](crate::game::state::GameState);
//! their visual representation lives in the rendering layer and is only
//! referenced through an opaque [`SpriteId`].

use std::fmt;
use serde::{Serialize, Deserialize};

use crate::game::team::TeamCharacter;

// =============================================================================
// PLAYER ID
// =============================================================================

/// Server-assigned player identifier.
///
/// Implements Ord so players can live in a BTreeMap with stable iteration.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    /// Create from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// POSITION
// =============================================================================

/// Position and facing of a player on the map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate in map pixels.
    pub x: f64,
    /// Vertical coordinate in map pixels.
    pub y: f64,
    /// Facing, as named by the rendering layer.
    #[serde(default)]
    pub direction: String,
}

impl Position {
    /// Create a new position.
    pub fn new(x: f64, y: f64, direction: impl Into<String>) -> Self {
        Self { x, y, direction: direction.into() }
    }
}

// =============================================================================
// SPRITE HANDLE
// =============================================================================

/// Opaque handle into the rendering layer's sprite registry.
///
/// This core never creates, reads or destroys the sprite behind it; the
/// handle is only passed back to the registry to toggle visibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpriteId(pub u64);

// =============================================================================
// PLAYER
// =============================================================================

/// State of a single player in the session.
#[derive(Clone, Debug, PartialEq)]
pub struct Player {
    /// Unique player ID
    pub id: PlayerId,

    /// Display name
    pub nickname: String,

    /// Team this player belongs to (non-owning back-reference)
    pub team: TeamCharacter,

    /// Last known position
    pub position: Position,

    /// Still in the game?
    pub alive: bool,

    /// Still connected to the room?
    pub connected: bool,

    /// Seek attempts left in the current round
    pub rest_seek_count: u32,

    /// Number of hiders this player has found
    pub catch_count: u32,

    /// Movement allowed (toggled by FREEZE / UNFREEZE)
    pub can_move: bool,

    /// Whether the rendering layer should draw this player
    pub visible: bool,

    /// Visual representation, if the rendering layer registered one
    pub sprite: Option<SpriteId>,
}

impl Player {
    /// Create a fresh, alive player on the given team.
    pub fn new(id: PlayerId, nickname: impl Into<String>, team: TeamCharacter, max_seek_count: u32) -> Self {
        Self {
            id,
            nickname: nickname.into(),
            team,
            position: Position::default(),
            alive: true,
            connected: true,
            rest_seek_count: max_seek_count,
            catch_count: 0,
            can_move: true,
            visible: true,
            sprite: None,
        }
    }

    /// Attach a sprite handle.
    pub fn with_sprite(mut self, sprite: Option<SpriteId>) -> Self {
        self.sprite = sprite;
        self
    }

    /// Overwrite the position.
    #[inline]
    pub fn set_position(&mut self, position: Position) {
        self.position = position;
    }

    /// Mark as found / eliminated.
    pub fn set_dead(&mut self) {
        self.alive = false;
    }

    /// Record a successful catch.
    pub fn increase_catch_count(&mut self) {
        self.catch_count += 1;
    }

    /// Seek attempts left, as computed from the server's used-attempt count.
    pub fn set_rest_seek_count(&mut self, count: u32) {
        self.rest_seek_count = count;
    }
}
