//! Network Layer
//!
//! Publish/subscribe plumbing between the game server and the local
//! session state. Everything async lives here; state rules live in `game/`.
//!
//! ## Module Structure
//!
//! - `protocol`: Wire envelope, inbound message decoding, outbound commands
//! - `barrier`: Initialization barrier
//! - `correlator`: Request correlation with deadlines
//! - `transport`: Transport trait and readiness notification
//! - `stomp`: STOMP over WebSocket transport
//! - `session`: Session synchronizer and dispatch loop

pub mod protocol;
pub mod barrier;
pub mod correlator;
pub mod transport;
pub mod stomp;
pub mod session;

pub use protocol::{Destinations, Envelope, InboundMessage, InteractionKind, InteractionResult, ProtocolError, RequestId};
pub use barrier::{Admission, InitBarrier};
pub use correlator::{CorrelatorError, PendingRequest, RequestCorrelator, Resolution};
pub use transport::{Subscription, Transport, TransportError, TransportHandle, TransportSlot};
pub use stomp::{StompError, StompFrame, StompTransport};
pub use session::{Channel, DispatchFailure, Dispatched, GameSession, InteractionReply, SessionError};
