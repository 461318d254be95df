//! Protocol Messages
//!
//! Wire format between the client and the game server over the pub/sub
//! channels. Every message is a JSON envelope:
//!
//! ```text
//! inbound   { "type": "PHASE_CHANGE", "data": { ... }, "requestId": "..."? }
//! outbound  { "requestId": "...", "data": { "objectId": "..." } }
//! ```
//!
//! Decoding is a total match over the known `type` strings; anything else is
//! an explicit [`ProtocolError::UnknownMessageType`].

use std::fmt;
use std::time::Duration;
use serde::{Serialize, Deserialize, de::DeserializeOwned};
use serde_json::Value;

use crate::game::phase::Phase;
use crate::game::player::{PlayerId, Position};
use crate::game::state::{SafeZone, TeamSetup};

/// Message type names as they appear in the `type` field.
pub mod kind {
    /// Game started (session channel).
    pub const GAME_START: &str = "GAME_START";
    /// Bootstrap: phase and team data (session channel).
    pub const GAME_INFO: &str = "GAME_INFO";
    /// Next round announced (session channel).
    pub const ROUND_CHANGE: &str = "ROUND_CHANGE";
    /// Phase transition (session channel).
    pub const PHASE_CHANGE: &str = "PHASE_CHANGE";
    /// Game over (session channel).
    pub const GAME_END: &str = "GAME_END";
    /// A player hid successfully (session channel).
    pub const INTERACT_HIDE_SUCCESS: &str = "INTERACT_HIDE_SUCCESS";
    /// A hide attempt failed (session channel).
    pub const INTERACT_HIDE_FAIL: &str = "INTERACT_HIDE_FAIL";
    /// A seeker found a hider (session channel).
    pub const INTERACT_SEEK_SUCCESS: &str = "INTERACT_SEEK_SUCCESS";
    /// A seek attempt found nobody (session channel).
    pub const INTERACT_SEEK_FAIL: &str = "INTERACT_SEEK_FAIL";
    /// A player is out (session channel).
    pub const ELIMINATION: &str = "ELIMINATION";
    /// A player left the game (session channel).
    pub const PLAYER_DISCONNECTED: &str = "PLAYER_DISCONNECTED";
    /// Safe zone shrank (session channel).
    pub const SAFE_ZONE_UPDATE: &str = "SAFE_ZONE_UPDATE";
    /// Teammate position (team channel).
    pub const SHARE_POSITION: &str = "SHARE_POSITION";
    /// Cover the screen (team channel).
    pub const COVER_SCREEN: &str = "COVER_SCREEN";
    /// Uncover the screen (team channel).
    pub const UNCOVER_SCREEN: &str = "UNCOVER_SCREEN";
    /// Stop local movement (team channel).
    pub const FREEZE: &str = "FREEZE";
    /// Allow local movement (team channel).
    pub const UNFREEZE: &str = "UNFREEZE";
}

// =============================================================================
// REQUEST ID
// =============================================================================

/// Correlation id attached to an outbound command and echoed by its result.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Raw inbound envelope, before the `type` is interpreted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Message type name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload.
    #[serde(default)]
    pub data: Value,
    /// Correlation id, present on results of our own commands.
    #[serde(default, alias = "correlationId")]
    pub request_id: Option<RequestId>,
}

/// Bootstrap payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameInfo {
    /// Phase at the time of the snapshot.
    pub current_phase: Phase,
    /// Fox team roster.
    pub fox_team: TeamInfo,
    /// Racoon team roster.
    pub racoon_team: TeamInfo,
}

/// One team in the bootstrap payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamInfo {
    /// Hiding this round?
    #[serde(default)]
    pub is_hiding_team: bool,
    /// Members in server order.
    #[serde(default)]
    pub players: Vec<TeamMember>,
}

impl TeamInfo {
    /// Convert into the state-layer setup.
    pub fn into_setup(self) -> TeamSetup {
        TeamSetup {
            is_hiding_team: self.is_hiding_team,
            members: self
                .players
                .into_iter()
                .map(|m| (m.player_id, m.player_nickname))
                .collect(),
        }
    }
}

/// Team member entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    /// Player identifier.
    pub player_id: PlayerId,
    /// Nickname, if the server includes it.
    #[serde(default, alias = "nickname")]
    pub player_nickname: Option<String>,
}

/// PHASE_CHANGE payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseChange {
    /// Phase entered.
    pub phase: Phase,
    /// How long it lasts.
    #[serde(default)]
    pub finish_after_milli_sec: u64,
}

impl PhaseChange {
    /// Phase length.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.finish_after_milli_sec)
    }
}

/// ROUND_CHANGE payload.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundChange {
    /// Round about to start.
    pub next_round: u32,
    /// Rounds in the game.
    pub total_round: u32,
}

/// Payload of the four interaction result types.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionInfo {
    /// Player who interacted.
    pub player_id: PlayerId,
    /// Object interacted with.
    #[serde(default)]
    pub object_id: Option<String>,
    /// Hider found; a placeholder on seek fails, see [`InteractionResult::found_player`].
    #[serde(default)]
    pub found_player_id: Option<PlayerId>,
    /// Seek attempts used this round (seek results only).
    #[serde(default)]
    pub catch_count: u32,
}

/// Payload naming a single player.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRef {
    /// Player identifier.
    pub player_id: PlayerId,
}

/// SHARE_POSITION payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharePosition {
    /// Whose position.
    pub player_id: PlayerId,
    /// Where.
    #[serde(flatten)]
    pub position: Position,
}

/// Which interaction result arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    /// Hide accepted.
    HideSuccess,
    /// Hide rejected.
    HideFail,
    /// Seeker found a hider.
    SeekSuccess,
    /// Seeker found nothing.
    SeekFail,
}

impl InteractionKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            InteractionKind::HideSuccess => kind::INTERACT_HIDE_SUCCESS,
            InteractionKind::HideFail => kind::INTERACT_HIDE_FAIL,
            InteractionKind::SeekSuccess => kind::INTERACT_SEEK_SUCCESS,
            InteractionKind::SeekFail => kind::INTERACT_SEEK_FAIL,
        }
    }

    /// Result of a seek command?
    pub fn is_seek(self) -> bool {
        matches!(self, InteractionKind::SeekSuccess | InteractionKind::SeekFail)
    }

    /// Successful outcome?
    pub fn is_success(self) -> bool {
        matches!(self, InteractionKind::HideSuccess | InteractionKind::SeekSuccess)
    }
}

/// Terminal event of a hide or seek command.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionResult {
    /// Outcome type.
    pub kind: InteractionKind,
    /// Outcome details.
    pub info: InteractionInfo,
}

impl InteractionResult {
    /// Hider caught by this result.
    ///
    /// Only a seek success catches anyone; the server fills `foundPlayerId`
    /// with a placeholder (`"NONE"`) on seek fails.
    pub fn found_player(&self) -> Option<&PlayerId> {
        match self.kind {
            InteractionKind::SeekSuccess => self.info.found_player_id.as_ref(),
            _ => None,
        }
    }
}

/// Typed inbound message.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// Game started.
    GameStart,
    /// Bootstrap snapshot.
    GameInfo(GameInfo),
    /// Round counter.
    RoundChange(RoundChange),
    /// Phase transition.
    PhaseChange(PhaseChange),
    /// Game over.
    GameEnd,
    /// Hide / seek result, ours or someone else's.
    Interaction {
        /// Correlation id of the command that caused it.
        request_id: Option<RequestId>,
        /// The result.
        result: InteractionResult,
    },
    /// Player eliminated.
    Elimination(PlayerRef),
    /// Player left.
    PlayerDisconnected(PlayerRef),
    /// New safe zone.
    SafeZoneUpdate(SafeZone),
    /// Teammate position.
    SharePosition(SharePosition),
    /// Cover the screen.
    CoverScreen,
    /// Uncover the screen.
    UncoverScreen,
    /// Stop local movement.
    Freeze,
    /// Allow local movement.
    Unfreeze,
}

impl InboundMessage {
    /// Decode a raw JSON message.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(s).map_err(ProtocolError::InvalidEnvelope)?;
        Self::from_envelope(envelope)
    }

    /// Interpret an envelope by its `type`.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { kind: type_name, data, request_id } = envelope;

        let interaction = |outcome: InteractionKind, data: Value| -> Result<Self, ProtocolError> {
            Ok(InboundMessage::Interaction {
                request_id: request_id.clone(),
                result: InteractionResult { kind: outcome, info: payload(outcome.as_str(), data)? },
            })
        };

        let message = match type_name.as_str() {
            kind::GAME_START => InboundMessage::GameStart,
            kind::GAME_INFO => InboundMessage::GameInfo(payload(kind::GAME_INFO, data)?),
            kind::ROUND_CHANGE => InboundMessage::RoundChange(payload(kind::ROUND_CHANGE, data)?),
            kind::PHASE_CHANGE => InboundMessage::PhaseChange(payload(kind::PHASE_CHANGE, data)?),
            kind::GAME_END => InboundMessage::GameEnd,
            kind::INTERACT_HIDE_SUCCESS => interaction(InteractionKind::HideSuccess, data)?,
            kind::INTERACT_HIDE_FAIL => interaction(InteractionKind::HideFail, data)?,
            kind::INTERACT_SEEK_SUCCESS => interaction(InteractionKind::SeekSuccess, data)?,
            kind::INTERACT_SEEK_FAIL => interaction(InteractionKind::SeekFail, data)?,
            kind::ELIMINATION => InboundMessage::Elimination(payload(kind::ELIMINATION, data)?),
            kind::PLAYER_DISCONNECTED => {
                InboundMessage::PlayerDisconnected(payload(kind::PLAYER_DISCONNECTED, data)?)
            }
            kind::SAFE_ZONE_UPDATE => InboundMessage::SafeZoneUpdate(payload(kind::SAFE_ZONE_UPDATE, data)?),
            kind::SHARE_POSITION => InboundMessage::SharePosition(payload(kind::SHARE_POSITION, data)?),
            kind::COVER_SCREEN => InboundMessage::CoverScreen,
            kind::UNCOVER_SCREEN => InboundMessage::UncoverScreen,
            kind::FREEZE => InboundMessage::Freeze,
            kind::UNFREEZE => InboundMessage::Unfreeze,
            _ => return Err(ProtocolError::UnknownMessageType(type_name)),
        };

        Ok(message)
    }

    /// Wire name of this message's type.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::GameStart => kind::GAME_START,
            InboundMessage::GameInfo(_) => kind::GAME_INFO,
            InboundMessage::RoundChange(_) => kind::ROUND_CHANGE,
            InboundMessage::PhaseChange(_) => kind::PHASE_CHANGE,
            InboundMessage::GameEnd => kind::GAME_END,
            InboundMessage::Interaction { result, .. } => result.kind.as_str(),
            InboundMessage::Elimination(_) => kind::ELIMINATION,
            InboundMessage::PlayerDisconnected(_) => kind::PLAYER_DISCONNECTED,
            InboundMessage::SafeZoneUpdate(_) => kind::SAFE_ZONE_UPDATE,
            InboundMessage::SharePosition(_) => kind::SHARE_POSITION,
            InboundMessage::CoverScreen => kind::COVER_SCREEN,
            InboundMessage::UncoverScreen => kind::UNCOVER_SCREEN,
            InboundMessage::Freeze => kind::FREEZE,
            InboundMessage::Unfreeze => kind::UNFREEZE,
        }
    }

    /// The one message allowed through before initialization.
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, InboundMessage::GameInfo(_))
    }
}

fn payload<T: DeserializeOwned>(kind: &'static str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::MalformedPayload { kind, source })
}

/// Errors decoding inbound messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Not a `{type, data}` JSON object.
    #[error("Invalid message envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),

    /// `type` is not one we know.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// `data` does not match the type.
    #[error("Malformed {kind} payload: {source}")]
    MalformedPayload {
        /// Message type.
        kind: &'static str,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Hide or seek command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractCommand {
    /// Correlation id echoed by the result.
    pub request_id: RequestId,
    /// Target of the interaction.
    pub data: InteractTarget,
}

/// Object a hide or seek command targets.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractTarget {
    /// Map object identifier.
    pub object_id: String,
}

impl InteractCommand {
    /// Build a command for `object_id`.
    pub fn new(request_id: RequestId, object_id: impl Into<String>) -> Self {
        Self {
            request_id,
            data: InteractTarget { object_id: object_id.into() },
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Room-scoped command destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    /// Hide command.
    pub hide: String,
    /// Seek command.
    pub seek: String,
    /// Position share.
    pub share_position: String,
}

impl Destinations {
    /// `{prefix}/rooms/{room_id}/game/...`
    pub fn for_room(prefix: &str, room_id: &str) -> Self {
        let base = format!("{}/rooms/{}/game", prefix.trim_end_matches('/'), room_id);
        Self {
            hide: format!("{base}/hide"),
            seek: format!("{base}/seek"),
            share_position: format!("{base}/share-position"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_game_info_decodes() {
        let json = r#"{
            "type": "GAME_INFO",
            "data": {
                "currentPhase": "INITIALIZED",
                "foxTeam": {"isHidingTeam": false, "players": [{"playerId": "b1", "playerNickname": "bea"}]},
                "racoonTeam": {"isHidingTeam": true, "players": [{"playerId": "a1"}]}
            }
        }"#;

        let msg = InboundMessage::from_json(json).unwrap();
        assert!(msg.is_bootstrap());
        if let InboundMessage::GameInfo(info) = msg {
            assert_eq!(info.current_phase, Phase::Initialized);
            assert!(info.racoon_team.is_hiding_team);
            let fox = info.fox_team.into_setup();
            assert_eq!(fox.members, vec![(PlayerId::new("b1"), Some("bea".to_string()))]);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_phase_change_decodes() {
        let json = r#"{"type":"PHASE_CHANGE","data":{"phase":"READY","finishAfterMilliSec":5000}}"#;
        match InboundMessage::from_json(json).unwrap() {
            InboundMessage::PhaseChange(change) => {
                assert_eq!(change.phase, Phase::Ready);
                assert_eq!(change.duration(), Duration::from_millis(5000));
            }
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_interaction_carries_request_id() {
        let json = r#"{
            "type": "INTERACT_SEEK_SUCCESS",
            "requestId": "req-1",
            "data": {"playerId": "b1", "objectId": "tree-3", "foundPlayerId": "a2", "catchCount": 1}
        }"#;

        match InboundMessage::from_json(json).unwrap() {
            InboundMessage::Interaction { request_id, result } => {
                assert_eq!(request_id, Some(RequestId::from("req-1")));
                assert_eq!(result.kind, InteractionKind::SeekSuccess);
                assert_eq!(result.info.found_player_id, Some(PlayerId::new("a2")));
                assert_eq!(result.info.catch_count, 1);
            }
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_seek_fail_placeholder_is_not_a_catch() {
        let json = r#"{
            "type": "INTERACT_SEEK_FAIL",
            "requestId": "r-2",
            "data": {"playerId": "b1", "objectId": "tree-4", "foundPlayerId": "NONE", "catchCount": 2}
        }"#;
        match InboundMessage::from_json(json).unwrap() {
            InboundMessage::Interaction { result, .. } => {
                assert_eq!(result.kind, InteractionKind::SeekFail);
                assert_eq!(result.found_player(), None);
                assert_eq!(result.info.catch_count, 2);
            }
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_correlation_id_alias() {
        let json = r#"{"type":"INTERACT_HIDE_FAIL","correlationId":"c-9","data":{"playerId":"a1"}}"#;
        match InboundMessage::from_json(json).unwrap() {
            InboundMessage::Interaction { request_id, result } => {
                assert_eq!(request_id, Some(RequestId::from("c-9")));
                assert!(!result.kind.is_success());
                assert!(!result.kind.is_seek());
            }
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_dataless_messages() {
        for (json, expected) in [
            (r#"{"type":"GAME_START"}"#, kind::GAME_START),
            (r#"{"type":"GAME_END","data":null}"#, kind::GAME_END),
            (r#"{"type":"FREEZE","data":{}}"#, kind::FREEZE),
            (r#"{"type":"UNCOVER_SCREEN"}"#, kind::UNCOVER_SCREEN),
        ] {
            assert_eq!(InboundMessage::from_json(json).unwrap().kind(), expected);
        }
    }

    #[test]
    fn test_share_position_flattened() {
        let json = r#"{"type":"SHARE_POSITION","data":{"playerId":"a1","x":3.5,"y":4,"direction":"up"}}"#;
        match InboundMessage::from_json(json).unwrap() {
            InboundMessage::SharePosition(share) => {
                assert_eq!(share.player_id, PlayerId::new("a1"));
                assert_eq!(share.position, Position::new(3.5, 4.0, "up"));
            }
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_unknown_message_type() {
        let result = InboundMessage::from_json(r#"{"type":"NOT_A_REAL_TYPE","data":{}}"#);
        assert!(matches!(result, Err(ProtocolError::UnknownMessageType(t)) if t == "NOT_A_REAL_TYPE"));
    }

    #[test]
    fn test_malformed_payload() {
        let result = InboundMessage::from_json(r#"{"type":"PHASE_CHANGE","data":{"phase":"LOBBY"}}"#);
        assert!(matches!(result, Err(ProtocolError::MalformedPayload { kind: "PHASE_CHANGE", .. })));

        let result = InboundMessage::from_json("not json");
        assert!(matches!(result, Err(ProtocolError::InvalidEnvelope(_))));
    }

    #[test]
    fn test_interact_command_shape() {
        let cmd = InteractCommand::new(RequestId::from("r-1"), "bush-7");
        let value: Value = serde_json::from_str(&cmd.to_json().unwrap()).unwrap();
        assert_eq!(value["requestId"], "r-1");
        assert_eq!(value["data"]["objectId"], "bush-7");
    }

    #[test]
    fn test_generated_request_ids_are_unique() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_destinations() {
        let dest = Destinations::for_room("/ws/", "1234");
        assert_eq!(dest.hide, "/ws/rooms/1234/game/hide");
        assert_eq!(dest.seek, "/ws/rooms/1234/game/seek");
        assert_eq!(dest.share_position, "/ws/rooms/1234/game/share-position");
    }
}
