//! Team Model
//!
//! Exactly two teams exist per session, identified by their character
//! (fox and racoon). Each round one team hides and the other seeks.

use std::fmt;
use serde::{Serialize, Deserialize};

use crate::game::player::PlayerId;

/// The two team slots of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TeamCharacter {
    /// Fox team
    Fox,
    /// Racoon team
    Racoon,
}

impl TeamCharacter {
    /// The other team.
    pub fn opponent(self) -> Self {
        match self {
            TeamCharacter::Fox => TeamCharacter::Racoon,
            TeamCharacter::Racoon => TeamCharacter::Fox,
        }
    }

    /// Parse a team name case-insensitively ("fox", "FOX", "Racoon", ...).
    pub fn parse(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("fox") {
            Some(TeamCharacter::Fox)
        } else if name.eq_ignore_ascii_case("racoon") {
            Some(TeamCharacter::Racoon)
        } else {
            None
        }
    }
}

impl fmt::Display for TeamCharacter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeamCharacter::Fox => f.write_str("FOX"),
            TeamCharacter::Racoon => f.write_str("RACOON"),
        }
    }
}

/// Role a team plays in the current round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Hides from the other team.
    Hiding,
    /// Looks for the hiding team.
    Seeking,
}

/// A team and its ordered member list.
#[derive(Clone, Debug, PartialEq)]
pub struct Team {
    /// Which slot this team occupies
    pub character: TeamCharacter,
    /// Members, in server order
    players: Vec<PlayerId>,
    /// Hiding this round?
    is_hiding_team: bool,
}

impl Team {
    /// Create a team.
    pub fn new(character: TeamCharacter, players: Vec<PlayerId>, is_hiding_team: bool) -> Self {
        Self { character, players, is_hiding_team }
    }

    /// Member ids in order.
    pub fn players(&self) -> &[PlayerId] {
        &self.players
    }

    /// Is `id` a member?
    pub fn contains(&self, id: &PlayerId) -> bool {
        self.players.contains(id)
    }

    /// Append a member if not already present.
    pub fn add_player(&mut self, id: PlayerId) {
        if !self.contains(&id) {
            self.players.push(id);
        }
    }

    /// Remove a member. Returns true if it was present.
    pub fn remove_player(&mut self, id: &PlayerId) -> bool {
        let before = self.players.len();
        self.players.retain(|p| p != id);
        self.players.len() != before
    }

    /// Is this the hiding team?
    pub fn is_hiding_team(&self) -> bool {
        self.is_hiding_team
    }

    /// Current role.
    pub fn role(&self) -> Role {
        if self.is_hiding_team { Role::Hiding } else { Role::Seeking }
    }

    /// Invert the role (end of round).
    pub(crate) fn flip_role(&mut self) {
        self.is_hiding_team = !self.is_hiding_team;
    }
}
