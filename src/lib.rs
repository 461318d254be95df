//! # Hide and Seek Client
//!
//! Client-side session synchronizer for the hide-and-seek multiplayer game.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   HIDE AND SEEK CLIENT                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/           - Session model (synchronous, no I/O)       │
//! │  ├── player.rs   - Player identity, position, status         │
//! │  ├── team.rs     - Fox / racoon teams and roles              │
//! │  ├── phase.rs    - Phase state machine and effects           │
//! │  ├── state.rs    - Session state, safe zone, bookkeeping     │
//! │  └── hooks.rs    - Roster, renderer and UI seams             │
//! │                                                              │
//! │  network/        - Pub/sub plumbing (async)                  │
//! │  ├── protocol.rs - Wire messages and destinations            │
//! │  ├── barrier.rs  - Initialization barrier                    │
//! │  ├── correlator.rs - Request/response correlation            │
//! │  ├── transport.rs- Transport seam and readiness              │
//! │  ├── stomp.rs    - STOMP over WebSocket                      │
//! │  └── session.rs  - Session synchronizer                      │
//! │                                                              │
//! │  config.rs       - Session and client configuration          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - No message except the bootstrap is applied before the session is
//!   initialized; earlier messages are replayed in arrival order.
//! - After initialization exactly one team hides.
//! - Every hide/seek command resolves once, with a result or a timeout.
//! - Unknown message types are reported, never silently dropped.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::{ClientConfig, PlayerInit, SessionConfig};
pub use game::{GameState, Phase, Player, PlayerId, Position, TeamCharacter};
pub use network::{GameSession, SessionError, StompTransport, TransportSlot};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
