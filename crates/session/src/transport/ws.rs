//! WebSocket signaling implementation of the [`Transport`] capability.
//!
//! Speaks a JSON signaling protocol over a single socket: text frames carry
//! lifecycle signals and data-channel packets, binary frames carry PCM16
//! audio for the currently subscribed remote track. Transient socket drops
//! are retried in place with capped geometric backoff; the higher-level
//! one-shot reconnect policy lives in the controller and is not this
//! module's concern.

use super::{
    RemoteAudioTrack, Transport, TransportCommand, TransportEvent, TransportHandle,
    TransportSession, TransportState, USER_INITIATED,
};
use crate::error::SessionError;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Backoff policy for transient signaling drops.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of dial attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap applied to the geometric progression.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Whether to randomize each delay to spread out herds.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero-based), capped at
    /// `max_delay`, with optional jitter in the range 50-100%.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let base = self.initial_delay.as_secs_f64() * factor;
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            capped * (0.5 + rand::random::<f64>() * 0.5)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

/// Probe run before any network I/O to confirm the host has working local
/// media. The embedding application injects its own check.
pub type MediaProbe = Box<dyn Fn() -> Result<(), String> + Send + Sync>;

/// [`Transport`] backed by the signaling WebSocket.
pub struct WsTransport {
    retry: RetryConfig,
    media_probe: Option<MediaProbe>,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl WsTransport {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            media_probe: None,
        }
    }

    /// Installs a local media-capability probe run during preflight.
    pub fn with_media_probe(mut self, probe: MediaProbe) -> Self {
        self.media_probe = Some(probe);
        self
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn preflight(&self) -> Result<(), SessionError> {
        if let Some(probe) = &self.media_probe {
            probe().map_err(SessionError::TransportConnect)?;
        }
        Ok(())
    }

    async fn connect(&self, url: &str, token: &str) -> Result<TransportSession, SessionError> {
        if url.is_empty() || token.is_empty() {
            return Err(SessionError::TransportConnect(
                "missing transport URL or token".to_string(),
            ));
        }

        let ws = dial(url, token, &self.retry, 0).await?;
        info!(%url, "signaling socket established");

        let (event_tx, events) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let pump = Pump {
            url: url.to_string(),
            token: token.to_string(),
            retry: self.retry.clone(),
            event_tx,
            audio: None,
            pending_publish: None,
        };
        tokio::spawn(pump.run(ws, cmd_rx));

        Ok(TransportSession {
            handle: TransportHandle::new(cmd_tx),
            events,
        })
    }
}

/// Dials the signaling server, retrying transient failures with backoff.
async fn dial(
    url: &str,
    token: &str,
    retry: &RetryConfig,
    first_attempt: u32,
) -> Result<WsStream, SessionError> {
    let mut attempt = first_attempt;
    loop {
        match connect_once(url, token).await {
            Ok(ws) => return Ok(ws),
            Err(e) if attempt + 1 < retry.max_attempts => {
                let delay = retry.delay_for(attempt);
                warn!(%url, attempt, error = %e, "dial failed, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(SessionError::TransportConnect(e.to_string())),
        }
    }
}

async fn connect_once(url: &str, token: &str) -> Result<WsStream, String> {
    let mut request = url.into_client_request().map_err(|e| e.to_string())?;
    let auth = format!("Bearer {token}")
        .parse()
        .map_err(|_| "token is not a valid header value".to_string())?;
    request.headers_mut().insert("Authorization", auth);
    let (ws, _) = connect_async(request).await.map_err(|e| e.to_string())?;
    Ok(ws)
}

/// Signals received from the server over text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum SignalMessage {
    Disconnected {
        reason: Option<String>,
    },
    ParticipantJoined {
        identity: String,
    },
    ParticipantLeft {
        identity: String,
    },
    TrackPublished {
        sid: String,
        participant: String,
        kind: String,
    },
    TrackUnpublished {
        sid: String,
        participant: String,
    },
    /// A data-channel packet; payload is base64 within the signaling JSON.
    Data {
        participant: String,
        payload: String,
    },
    LocalTrackPublished,
    LocalTrackUnpublished,
    Error {
        message: String,
    },
}

/// Signals sent to the server.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum SignalRequest {
    PublishTrack { kind: &'static str },
    SetTrackEnabled { enabled: bool },
    Leave,
}

/// Per-session pump state: translates frames into [`TransportEvent`]s and
/// commands into outbound signals.
struct Pump {
    url: String,
    token: String,
    retry: RetryConfig,
    event_tx: mpsc::Sender<TransportEvent>,
    /// The one active remote audio track's sample sender, keyed by sid.
    audio: Option<(String, mpsc::Sender<Vec<f32>>)>,
    pending_publish: Option<oneshot::Sender<Result<(), String>>>,
}

impl Pump {
    async fn run(mut self, mut ws: WsStream, mut commands: mpsc::Receiver<TransportCommand>) {
        self.emit(TransportEvent::Connected).await;
        self.emit(TransportEvent::StateChanged(TransportState::Connected))
            .await;

        'session: loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(TransportCommand::PublishMicrophone { ack }) => {
                        self.pending_publish = Some(ack);
                        if send_signal(&mut ws, &SignalRequest::PublishTrack { kind: "audio" })
                            .await
                            .is_err()
                        {
                            if let Some(ack) = self.pending_publish.take() {
                                let _ = ack.send(Err("signaling send failed".to_string()));
                            }
                        }
                    }
                    Some(TransportCommand::SetMicrophoneEnabled(enabled)) => {
                        let _ = send_signal(&mut ws, &SignalRequest::SetTrackEnabled { enabled }).await;
                    }
                    Some(TransportCommand::Disconnect) | None => {
                        // Handle dropped or explicit hang-up: leave cleanly.
                        let _ = send_signal(&mut ws, &SignalRequest::Leave).await;
                        let _ = ws.close(None).await;
                        self.emit(TransportEvent::Disconnected {
                            reason: USER_INITIATED.to_string(),
                        })
                        .await;
                        break 'session;
                    }
                },
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if self.handle_signal(&text).await == Flow::Closed {
                            break 'session;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => self.forward_audio(&data),
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Err(_)) | Some(Ok(Message::Close(_))) | None => {
                        match self.redial().await {
                            Some(fresh) => ws = fresh,
                            None => {
                                self.emit(TransportEvent::Disconnected {
                                    reason: "connection lost".to_string(),
                                })
                                .await;
                                break 'session;
                            }
                        }
                    }
                },
            }
        }

        self.emit(TransportEvent::StateChanged(TransportState::Disconnected))
            .await;
    }

    async fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event).await;
    }

    async fn handle_signal(&mut self, text: &str) -> Flow {
        let signal: SignalMessage = match serde_json::from_str(text) {
            Ok(signal) => signal,
            Err(e) => {
                debug!(error = %e, "ignoring unrecognized signal frame");
                return Flow::Continue;
            }
        };

        match signal {
            SignalMessage::Disconnected { reason } => {
                self.emit(TransportEvent::Disconnected {
                    reason: reason.unwrap_or_else(|| "server closed the session".to_string()),
                })
                .await;
                return Flow::Closed;
            }
            SignalMessage::ParticipantJoined { identity } => {
                self.emit(TransportEvent::ParticipantJoined { identity }).await;
            }
            SignalMessage::ParticipantLeft { identity } => {
                self.emit(TransportEvent::ParticipantLeft { identity }).await;
            }
            SignalMessage::TrackPublished {
                sid,
                participant,
                kind,
            } => {
                if kind == "audio" {
                    let (samples_tx, samples) = mpsc::channel(32);
                    self.audio = Some((sid.clone(), samples_tx));
                    self.emit(TransportEvent::TrackSubscribed {
                        track: RemoteAudioTrack { sid, samples },
                        participant,
                    })
                    .await;
                }
            }
            SignalMessage::TrackUnpublished { sid, participant } => {
                if matches!(&self.audio, Some((active, _)) if *active == sid) {
                    self.audio = None;
                }
                self.emit(TransportEvent::TrackUnsubscribed { sid, participant })
                    .await;
            }
            SignalMessage::Data {
                participant,
                payload,
            } => match BASE64.decode(payload) {
                Ok(bytes) => {
                    self.emit(TransportEvent::DataReceived {
                        payload: Bytes::from(bytes),
                        participant,
                    })
                    .await;
                }
                Err(e) => debug!(error = %e, "dropping data packet with invalid base64"),
            },
            SignalMessage::LocalTrackPublished => {
                if let Some(ack) = self.pending_publish.take() {
                    let _ = ack.send(Ok(()));
                }
                self.emit(TransportEvent::LocalTrackPublished).await;
            }
            SignalMessage::LocalTrackUnpublished => {
                self.emit(TransportEvent::LocalTrackUnpublished).await;
            }
            SignalMessage::Error { message } => {
                if let Some(ack) = self.pending_publish.take() {
                    let _ = ack.send(Err(message));
                } else {
                    warn!(%message, "signaling error");
                }
            }
        }
        Flow::Continue
    }

    /// Routes a binary PCM16 frame to the active remote track. A slow
    /// consumer drops frames rather than backing up the socket.
    fn forward_audio(&mut self, data: &[u8]) {
        if let Some((_, samples_tx)) = &self.audio {
            let _ = samples_tx.try_send(pcm16_to_f32(data));
        }
    }

    /// Transparent in-place reconnect after a transient socket drop.
    async fn redial(&mut self) -> Option<WsStream> {
        self.emit(TransportEvent::Reconnecting).await;
        self.emit(TransportEvent::StateChanged(TransportState::Reconnecting))
            .await;
        match dial(&self.url, &self.token, &self.retry, 0).await {
            Ok(ws) => {
                info!("signaling socket re-established");
                self.emit(TransportEvent::Reconnected).await;
                self.emit(TransportEvent::StateChanged(TransportState::Connected))
                    .await;
                Some(ws)
            }
            Err(e) => {
                warn!(error = %e, "transient reconnect exhausted");
                None
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Closed,
}

async fn send_signal(ws: &mut WsStream, signal: &SignalRequest) -> Result<(), String> {
    let serialized = serde_json::to_string(signal).map_err(|e| e.to_string())?;
    ws.send(Message::Text(serialized))
        .await
        .map_err(|e| e.to_string())
}

fn pcm16_to_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_geometrically_and_caps() {
        let retry = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(250));
        assert_eq!(retry.delay_for(1), Duration::from_millis(500));
        assert_eq!(retry.delay_for(2), Duration::from_millis(1000));
        // Far past the cap.
        assert_eq!(retry.delay_for(10), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let retry = RetryConfig::default();
        for attempt in 0..4 {
            let ceiling = {
                let no_jitter = RetryConfig {
                    jitter: false,
                    ..retry.clone()
                };
                no_jitter.delay_for(attempt)
            };
            let delay = retry.delay_for(attempt);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }

    #[test]
    fn parses_signaling_frames() {
        let joined: SignalMessage =
            serde_json::from_str(r#"{"event":"participant_joined","identity":"agent-main"}"#)
                .expect("valid signal");
        assert!(matches!(
            joined,
            SignalMessage::ParticipantJoined { identity } if identity == "agent-main"
        ));

        let track: SignalMessage = serde_json::from_str(
            r#"{"event":"track_published","sid":"TR_1","participant":"agent-main","kind":"audio"}"#,
        )
        .expect("valid signal");
        assert!(matches!(track, SignalMessage::TrackPublished { kind, .. } if kind == "audio"));

        assert!(serde_json::from_str::<SignalMessage>(r#"{"event":"unheard_of"}"#).is_err());
    }

    #[test]
    fn pcm16_conversion_is_normalized() {
        let samples = pcm16_to_f32(&[0x00, 0x00, 0xff, 0x7f, 0x00, 0x80]);
        assert_eq!(samples.len(), 3);
        assert!(samples[0].abs() < f32::EPSILON);
        assert!((samples[1] - (32767.0 / 32768.0)).abs() < 1e-6);
        assert!((samples[2] + 1.0).abs() < 1e-6);
    }
}
