//! Game Model Module
//!
//! Session state as the client sees it. Synchronous, no I/O.
//!
//! ## Module Structure
//!
//! - `player`: Player identity, position and status
//! - `team`: The two teams and their hiding/seeking role
//! - `phase`: Phase state machine and per-phase effects
//! - `state`: Session state, safe zone, seek bookkeeping
//! - `hooks`: Seams to the roster, renderer and UI queue

pub mod player;
pub mod team;
pub mod phase;
pub mod state;
pub mod hooks;

// Re-export key types
pub use player::{Player, PlayerId, Position, SpriteId};
pub use team::{Role, Team, TeamCharacter};
pub use phase::{Phase, PhaseEffect};
pub use state::{GameState, RoundInfo, SafeZone, StateError, TeamSetup, Teams};
pub use hooks::{Collaborators, PhaseNotice, PhaseNotifier, Roster, RosterEntry, VisibilityRegistry};
