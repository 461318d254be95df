//! Configuration
//!
//! Plain structs with sensible defaults, overridable from the environment.

use std::time::Duration;

use crate::game::player::{PlayerId, Position};
use crate::game::team::TeamCharacter;

/// Seek attempts a player gets per round.
pub const DEFAULT_MAX_SEEK_COUNT: u32 = 5;

/// Messages held while waiting for the bootstrap.
pub const DEFAULT_MAX_STALLED_MESSAGES: usize = 256;

/// Configuration for a game session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for a correlated hide/seek result and for player initialization.
    pub request_timeout: Duration,
    /// Seek attempts per round.
    pub max_seek_count: u32,
    /// Prefix of outbound command destinations.
    pub destination_prefix: String,
    /// Buffered dispatch failures before new ones are dropped.
    pub failure_channel_capacity: usize,
    /// Messages held before the bootstrap; further ones are refused.
    pub max_stalled_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_seek_count: DEFAULT_MAX_SEEK_COUNT,
            destination_prefix: "/ws".to_string(),
            failure_channel_capacity: 64,
            max_stalled_messages: DEFAULT_MAX_STALLED_MESSAGES,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `HIDE_SEEK_REQUEST_TIMEOUT_MS`, `HIDE_SEEK_MAX_SEEK_COUNT`
    /// and `HIDE_SEEK_MAX_STALLED_MESSAGES`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: env_parse("HIDE_SEEK_REQUEST_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            max_seek_count: env_parse("HIDE_SEEK_MAX_SEEK_COUNT").unwrap_or(defaults.max_seek_count),
            max_stalled_messages: env_parse("HIDE_SEEK_MAX_STALLED_MESSAGES")
                .unwrap_or(defaults.max_stalled_messages),
            ..defaults
        }
    }
}

/// Local identity handed to
/// [`GameSession::initialize_player`](crate::network::session::GameSession::initialize_player).
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerInit {
    /// Local player id.
    pub player_id: PlayerId,
    /// Team the server put us on.
    pub team: TeamCharacter,
    /// Spawn position.
    pub position: Position,
    /// Team-scoped channel to subscribe to.
    pub team_destination: String,
}

/// Configuration for the client binary.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the STOMP broker.
    pub server_url: String,
    /// Room to join.
    pub room_id: String,
    /// Session-scoped channel.
    pub game_destination: String,
    /// Local identity, if known up front.
    pub player: Option<PlayerInit>,
    /// Delay between connection attempts.
    pub connect_retry_interval: Duration,
    /// Session settings.
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let room_id = "1".to_string();
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_string(),
            game_destination: game_topic(&room_id),
            room_id,
            player: None,
            connect_retry_interval: Duration::from_millis(100),
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load from `HIDE_SEEK_*` environment variables.
    ///
    /// The local identity is set when both `HIDE_SEEK_PLAYER_ID` and a
    /// valid `HIDE_SEEK_TEAM` are present.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let room_id = std::env::var("HIDE_SEEK_ROOM_ID").unwrap_or(defaults.room_id);
        let game_destination =
            std::env::var("HIDE_SEEK_GAME_DESTINATION").unwrap_or_else(|_| game_topic(&room_id));

        let team = std::env::var("HIDE_SEEK_TEAM").ok().and_then(|t| TeamCharacter::parse(&t));
        let player = match (std::env::var("HIDE_SEEK_PLAYER_ID").ok(), team) {
            (Some(id), Some(team)) => Some(PlayerInit {
                player_id: PlayerId::new(id),
                team,
                position: Position::default(),
                team_destination: std::env::var("HIDE_SEEK_TEAM_DESTINATION")
                    .unwrap_or_else(|_| team_topic(&game_destination, team)),
            }),
            _ => None,
        };

        Self {
            server_url: std::env::var("HIDE_SEEK_SERVER_URL").unwrap_or(defaults.server_url),
            room_id,
            game_destination,
            player,
            connect_retry_interval: env_parse("HIDE_SEEK_CONNECT_RETRY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_retry_interval),
            session: SessionConfig::from_env(),
        }
    }
}

fn game_topic(room_id: &str) -> String {
    format!("/topic/rooms/{room_id}/game")
}

fn team_topic(game_destination: &str, team: TeamCharacter) -> String {
    format!("{}/{}", game_destination, team.to_string().to_lowercase())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
