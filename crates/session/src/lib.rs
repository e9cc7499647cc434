//! Voicelink session library.
//!
//! Turns a "connect" intent into a fully negotiated, ready-for-speech
//! session with a remote voice agent, and guarantees clean teardown under
//! every failure and exit path. Structure, leaves first:
//!
//! - `credential`: obtains short-lived session credentials.
//! - `transport`: the media-transport collaborator trait, its event model
//!   and the WebSocket signaling implementation.
//! - `device`: microphone acquisition and mute state.
//! - `track`: inbound agent audio and the analysis tap.
//! - `events`: the data-channel event decoder.
//! - `state`: the authoritative connection record and its reducer.
//! - `controller`: the actor composing all of the above.

pub mod config;
pub mod controller;
pub mod credential;
pub mod device;
pub mod error;
pub mod events;
pub mod state;
pub mod track;
pub mod transport;

pub use config::Config;
pub use controller::{ControllerConfig, SessionController};
pub use credential::{CredentialProvider, HttpCredentialClient, SessionCredential};
pub use error::SessionError;
pub use events::InboundEvent;
pub use state::{ConnectionState, IndicatorState, SessionSnapshot, Status};
pub use track::AnalyserTap;
pub use transport::{Transport, TransportEvent, TransportSession};
