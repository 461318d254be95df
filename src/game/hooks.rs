//! External Collaborators
//!
//! The session core decides what is true and what should be visible; the
//! room roster, the renderer and the UI notification queue live elsewhere.
//! These traits are the seams to them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::game::phase::Phase;
use crate::game::player::{PlayerId, SpriteId};

/// A participant as the room roster knows it.
#[derive(Clone, Debug, PartialEq)]
pub struct RosterEntry {
    /// Player identifier
    pub id: PlayerId,
    /// Display name
    pub nickname: String,
    /// Visual handle registered by the renderer
    pub sprite: Option<SpriteId>,
}

/// Room entity that supplies the joined-player list.
pub trait Roster: Send + Sync {
    /// Players currently joined to the room.
    fn joined_players(&self) -> Vec<RosterEntry>;
}

/// Rendering registry that can show or hide a sprite.
pub trait VisibilityRegistry: Send + Sync {
    /// Toggle visibility of `sprite`.
    fn set_visible(&self, sprite: SpriteId, visible: bool);
}

/// UI queue that announces phase changes to the player.
pub trait PhaseNotifier: Send + Sync {
    /// A READY or MAIN phase started and lasts `duration`.
    fn phase_changed(&self, phase: Phase, duration: Duration);
}

/// A phase announcement, as delivered through [`mpsc`] by the channel notifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseNotice {
    /// Phase entered
    pub phase: Phase,
    /// How long it lasts
    pub duration: Duration,
}

impl PhaseNotifier for mpsc::UnboundedSender<PhaseNotice> {
    fn phase_changed(&self, phase: Phase, duration: Duration) {
        // UI side went away; nothing left to notify.
        let _ = self.send(PhaseNotice { phase, duration });
    }
}

/// Roster with no players; bootstrap team data alone populates the session.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyRoster;

impl Roster for EmptyRoster {
    fn joined_players(&self) -> Vec<RosterEntry> {
        Vec::new()
    }
}

impl Roster for Vec<RosterEntry> {
    fn joined_players(&self) -> Vec<RosterEntry> {
        self.clone()
    }
}

/// Collaborator that ignores every call (headless runs).
#[derive(Debug, Default, Clone, Copy)]
pub struct Headless;

impl VisibilityRegistry for Headless {
    fn set_visible(&self, _sprite: SpriteId, _visible: bool) {}
}

impl PhaseNotifier for Headless {
    fn phase_changed(&self, _phase: Phase, _duration: Duration) {}
}

/// Bundle of collaborators handed to a session.
#[derive(Clone)]
pub struct Collaborators {
    /// Joined-player list
    pub roster: Arc<dyn Roster>,
    /// Sprite visibility toggle
    pub visibility: Arc<dyn VisibilityRegistry>,
    /// Phase announcements
    pub notifier: Arc<dyn PhaseNotifier>,
}

impl Collaborators {
    /// Build from concrete collaborators.
    pub fn new(
        roster: impl Roster + 'static,
        visibility: impl VisibilityRegistry + 'static,
        notifier: impl PhaseNotifier + 'static,
    ) -> Self {
        Self {
            roster: Arc::new(roster),
            visibility: Arc::new(visibility),
            notifier: Arc::new(notifier),
        }
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::new(EmptyRoster, Headless, Headless)
    }
}
