//! The transport session collaborator.
//!
//! The lifecycle controller never talks to the media service directly; it
//! goes through the [`Transport`] trait, which hands back a
//! [`TransportSession`]: a command handle plus a stream of lifecycle
//! notifications. `ws` implements the trait against the real signaling
//! server; tests script it with channel-backed fakes.

pub mod ws;

use crate::error::SessionError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Bound on the wait for a microphone publication acknowledgement.
const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Disconnect reason reported for a deliberate local hang-up. Anything else
/// counts as unexpected.
pub const USER_INITIATED: &str = "user-initiated";

/// Low-level connection state reported by the transport implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// A subscribed remote audio track: its id plus a live PCM sample stream.
///
/// The sample receiver is the single playback path; the analysis tap is
/// built over the same stream rather than a second subscription.
#[derive(Debug)]
pub struct RemoteAudioTrack {
    pub sid: String,
    pub samples: mpsc::Receiver<Vec<f32>>,
}

/// Lifecycle notifications emitted by an established transport session.
#[derive(Debug)]
pub enum TransportEvent {
    /// The low-level handshake completed. Not yet the externally visible
    /// "connected" milestone, which waits for the agent participant.
    Connected,
    Disconnected {
        reason: String,
    },
    ParticipantJoined {
        identity: String,
    },
    ParticipantLeft {
        identity: String,
    },
    TrackSubscribed {
        track: RemoteAudioTrack,
        participant: String,
    },
    TrackUnsubscribed {
        sid: String,
        participant: String,
    },
    /// An out-of-band data-channel packet, in arrival order.
    DataReceived {
        payload: Bytes,
        participant: String,
    },
    LocalTrackPublished,
    LocalTrackUnpublished,
    Reconnecting,
    Reconnected,
    StateChanged(TransportState),
}

/// Commands the controller can issue on a live session.
#[derive(Debug)]
pub enum TransportCommand {
    /// Publish the local microphone track. Acknowledged once the server
    /// confirms the publication.
    PublishMicrophone {
        ack: oneshot::Sender<Result<(), String>>,
    },
    /// Reflect the mute flag onto the outbound audio publication.
    SetMicrophoneEnabled(bool),
    Disconnect,
}

/// Cloneable command side of a live session.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    commands: mpsc::Sender<TransportCommand>,
}

impl TransportHandle {
    pub fn new(commands: mpsc::Sender<TransportCommand>) -> Self {
        Self { commands }
    }

    /// Publishes the local microphone and waits for the acknowledgement.
    /// The wait is bounded so a silent server degrades the session instead
    /// of stalling the controller.
    pub async fn publish_microphone(&self) -> Result<(), SessionError> {
        let (ack, confirmed) = oneshot::channel();
        self.commands
            .send(TransportCommand::PublishMicrophone { ack })
            .await
            .map_err(|_| SessionError::MicrophoneUnavailable("transport closed".to_string()))?;
        match tokio::time::timeout(PUBLISH_ACK_TIMEOUT, confirmed).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(SessionError::MicrophoneUnavailable(reason)),
            Ok(Err(_)) => Err(SessionError::MicrophoneUnavailable(
                "transport dropped the publication request".to_string(),
            )),
            Err(_) => Err(SessionError::MicrophoneUnavailable(
                "no acknowledgement from transport".to_string(),
            )),
        }
    }

    pub async fn set_microphone_enabled(&self, enabled: bool) {
        let _ = self
            .commands
            .send(TransportCommand::SetMicrophoneEnabled(enabled))
            .await;
    }

    /// Requests a user-initiated disconnect. Best effort: a transport that
    /// already died has nothing left to tear down.
    pub async fn disconnect(&self) {
        let _ = self.commands.send(TransportCommand::Disconnect).await;
    }
}

/// An established session: the command handle and the event stream.
#[derive(Debug)]
pub struct TransportSession {
    pub handle: TransportHandle,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// The external media-transport capability.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Local media-capability preflight. Runs before any network I/O; a
    /// failure here fails the connect attempt fast.
    fn preflight(&self) -> Result<(), SessionError>;

    /// Connects to the transport service. Fails fast on an empty URL or
    /// token without attempting anything.
    async fn connect(&self, url: &str, token: &str) -> Result<TransportSession, SessionError>;
}
