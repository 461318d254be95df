//! Phase State Machine
//!
//! ```text
//! INITIALIZING ─► INITIALIZED ─► READY ─► MAIN ─► END ─┬─► READY (next round)
//!                                                       └─► FINISHED
//! ```
//!
//! Transitions are driven by the server. This module only knows which
//! transitions are expected and what each phase means for visibility and
//! team roles, given the local player's role.

use std::fmt;
use serde::{Serialize, Deserialize};

use crate::game::team::Role;

/// Session phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Session created, waiting for the bootstrap message
    #[default]
    Initializing,
    /// Teams and players are known
    Initialized,
    /// Hiding team looks for a hiding spot
    Ready,
    /// Seeking team looks for the hiders
    Main,
    /// Round wrap-up, roles flip
    End,
    /// Game over
    Finished,
}

impl Phase {
    /// Wire name of the phase.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Initializing => "INITIALIZING",
            Phase::Initialized => "INITIALIZED",
            Phase::Ready => "READY",
            Phase::Main => "MAIN",
            Phase::End => "END",
            Phase::Finished => "FINISHED",
        }
    }

    /// Whether `next` is an expected successor of `self`.
    ///
    /// Re-entering the same phase is tolerated (duplicate delivery).
    /// Any phase may jump to FINISHED when the game is cut short.
    pub fn can_transition_to(self, next: Phase) -> bool {
        if self == next || next == Phase::Finished {
            return true;
        }
        matches!(
            (self, next),
            (Phase::Initializing, Phase::Initialized)
                | (Phase::Initialized, Phase::Ready)
                | (Phase::Ready, Phase::Main)
                | (Phase::Main, Phase::End)
                | (Phase::End, Phase::Ready)
        )
    }

    /// READY and MAIN are announced to the UI notification queue.
    pub fn is_announced(self) -> bool {
        matches!(self, Phase::Ready | Phase::Main)
    }

    /// Side effect of entering this phase, for a local player with `local_role`.
    pub fn effect(self, local_role: Role) -> PhaseEffect {
        match (self, local_role) {
            (Phase::Ready, Role::Hiding) => PhaseEffect::Visibility {
                seeking_visible: true,
                hiding_visible: true,
            },
            (Phase::Ready, Role::Seeking) | (Phase::Main, _) => PhaseEffect::Visibility {
                seeking_visible: true,
                hiding_visible: false,
            },
            (Phase::End, _) => PhaseEffect::FlipRoles,
            _ => PhaseEffect::None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a phase change does to local team state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseEffect {
    /// Nothing changes.
    None,
    /// Show or hide every player of each team (except the local player).
    Visibility {
        /// Seeking team drawn?
        seeking_visible: bool,
        /// Hiding team drawn?
        hiding_visible: bool,
    },
    /// Both teams invert their hiding role.
    FlipRoles,
}
