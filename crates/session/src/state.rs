//! The authoritative connection state and its single mutator.
//!
//! Every component reports into this reducer instead of mutating scattered
//! flags, so the readiness invariant is checkable in exactly one place:
//! after every transition, `ready_for_speech` equals
//! `transport_connected && remote_joined && microphone_enabled`.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Coarse status exposed to the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// The one externally observed connection record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub token_generated: bool,
    pub transport_connected: bool,
    pub remote_joined: bool,
    pub microphone_enabled: bool,
    pub ready_for_speech: bool,
    pub status: Status,
    pub status_message: String,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            token_generated: false,
            transport_connected: false,
            remote_joined: false,
            microphone_enabled: false,
            ready_for_speech: false,
            status: Status::Disconnected,
            status_message: "Disconnected".to_string(),
        }
    }
}

/// Defined state transitions. The controller may only mutate
/// [`ConnectionState`] by applying one of these.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Explicit connect request; resets the record and enters `Connecting`.
    ConnectRequested,
    TokenAcquired,
    TransportConnected,
    MicrophoneEnabled,
    /// Acquisition failed; the session stays up without a microphone.
    MicrophoneDegraded(String),
    RemoteJoined,
    RemoteLeft,
    /// Unexpected drop with the single delayed reconnect scheduled.
    ReconnectScheduled(String),
    /// Fatal failure; recovery requires a fresh explicit connect.
    Failed(String),
    /// Forced cleanup from any state back to the initial record.
    Teardown,
}

impl ConnectionState {
    /// Applies one transition. The readiness invariant is re-established
    /// before returning, and reaching the full flag set while `Connecting`
    /// promotes the status to `Connected`.
    pub fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::ConnectRequested => {
                *self = Self::default();
                self.status = Status::Connecting;
                self.status_message = "Requesting session credential".to_string();
            }
            Transition::TokenAcquired => {
                self.token_generated = true;
                self.status_message = "Credential acquired, connecting transport".to_string();
            }
            Transition::TransportConnected => {
                self.transport_connected = true;
                self.status_message = "Transport connected, waiting for agent".to_string();
            }
            Transition::MicrophoneEnabled => {
                self.microphone_enabled = true;
                self.status_message = "Microphone live".to_string();
            }
            Transition::MicrophoneDegraded(message) => {
                self.microphone_enabled = false;
                self.status_message = message;
            }
            Transition::RemoteJoined => {
                self.remote_joined = true;
                self.status_message = "Agent joined".to_string();
            }
            Transition::RemoteLeft => {
                self.remote_joined = false;
                self.status_message = "Agent left the session".to_string();
            }
            Transition::ReconnectScheduled(message) => {
                self.token_generated = false;
                self.transport_connected = false;
                self.remote_joined = false;
                self.microphone_enabled = false;
                self.status = Status::Connecting;
                self.status_message = message;
            }
            Transition::Failed(message) => {
                self.token_generated = false;
                self.transport_connected = false;
                self.remote_joined = false;
                self.microphone_enabled = false;
                self.status = Status::Error;
                self.status_message = message;
            }
            Transition::Teardown => {
                *self = Self::default();
            }
        }

        self.ready_for_speech =
            self.transport_connected && self.remote_joined && self.microphone_enabled;
        if self.status == Status::Connecting && self.ready_for_speech {
            self.status = Status::Connected;
            self.status_message = "Connected, ready for speech".to_string();
        }
    }
}

/// The memory/tool indicator surface driven by the event decoder, plus the
/// speaking flag driven by the analysis tap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndicatorState {
    pub memory: Option<MemoryIndicator>,
    pub tool: Option<String>,
    /// Sticky; survives until teardown.
    pub memory_fallback: bool,
    pub agent_speaking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryIndicator {
    pub kind: String,
    pub message: Option<String>,
}

/// What the host application observes: connection record plus indicators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub indicators: IndicatorState,
}

/// Capacity of the rolling debug log.
pub const DEBUG_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Capped rolling log of timestamped lifecycle messages.
#[derive(Debug, Clone, Default)]
pub struct DebugLog {
    entries: VecDeque<LogEntry>,
}

impl DebugLog {
    pub fn push(&mut self, message: impl Into<String>) {
        if self.entries.len() == DEBUG_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn invariant_holds(state: &ConnectionState) -> bool {
        state.ready_for_speech
            == (state.transport_connected && state.remote_joined && state.microphone_enabled)
    }

    #[test]
    fn happy_path_reaches_connected() {
        let mut state = ConnectionState::default();
        for transition in [
            Transition::ConnectRequested,
            Transition::TokenAcquired,
            Transition::TransportConnected,
            Transition::MicrophoneEnabled,
            Transition::RemoteJoined,
        ] {
            state.apply(transition);
            assert!(invariant_holds(&state));
        }
        assert_eq!(state.status, Status::Connected);
        assert!(state.ready_for_speech);
        assert_eq!(state.status_message, "Connected, ready for speech");
    }

    #[test]
    fn agent_may_join_before_microphone() {
        let mut state = ConnectionState::default();
        state.apply(Transition::ConnectRequested);
        state.apply(Transition::TokenAcquired);
        state.apply(Transition::TransportConnected);
        state.apply(Transition::RemoteJoined);
        assert_eq!(state.status, Status::Connecting);
        assert!(!state.ready_for_speech);

        state.apply(Transition::MicrophoneEnabled);
        assert_eq!(state.status, Status::Connected);
        assert!(state.ready_for_speech);
    }

    #[test]
    fn degraded_microphone_blocks_readiness_without_erroring() {
        let mut state = ConnectionState::default();
        state.apply(Transition::ConnectRequested);
        state.apply(Transition::TransportConnected);
        state.apply(Transition::RemoteJoined);
        state.apply(Transition::MicrophoneDegraded(
            "microphone unavailable: permission denied".to_string(),
        ));
        assert_eq!(state.status, Status::Connecting);
        assert!(!state.ready_for_speech);
        assert!(state.status_message.contains("microphone"));
    }

    #[test]
    fn teardown_restores_initial_record_from_anywhere() {
        let mut connected = ConnectionState::default();
        for transition in [
            Transition::ConnectRequested,
            Transition::TransportConnected,
            Transition::MicrophoneEnabled,
            Transition::RemoteJoined,
        ] {
            connected.apply(transition);
        }
        connected.apply(Transition::Teardown);
        assert_eq!(connected, ConnectionState::default());

        let mut failed = ConnectionState::default();
        failed.apply(Transition::ConnectRequested);
        failed.apply(Transition::Failed("connection attempt timed out".into()));
        assert_eq!(failed.status, Status::Error);
        failed.apply(Transition::Teardown);
        assert_eq!(failed, ConnectionState::default());
    }

    #[test]
    fn invariant_survives_randomized_orderings() {
        let transitions: Vec<Transition> = vec![
            Transition::ConnectRequested,
            Transition::TokenAcquired,
            Transition::TransportConnected,
            Transition::MicrophoneEnabled,
            Transition::MicrophoneDegraded("mic gone".into()),
            Transition::RemoteJoined,
            Transition::RemoteLeft,
            Transition::ReconnectScheduled("reconnecting".into()),
            Transition::Failed("boom".into()),
            Transition::Teardown,
        ];

        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut shuffled = transitions.clone();
            shuffled.shuffle(&mut rng);
            let mut state = ConnectionState::default();
            for transition in shuffled {
                state.apply(transition);
                assert!(invariant_holds(&state), "violated at {state:?}");
            }
        }
    }

    #[test]
    fn failed_carries_the_message_and_clears_flags() {
        let mut state = ConnectionState::default();
        state.apply(Transition::ConnectRequested);
        state.apply(Transition::TransportConnected);
        state.apply(Transition::Failed(
            "connection attempt timed out after 30 seconds".to_string(),
        ));
        assert_eq!(state.status, Status::Error);
        assert!(!state.transport_connected);
        assert!(!state.ready_for_speech);
        assert!(state.status_message.contains("timed out"));
    }

    #[test]
    fn debug_log_caps_at_fifty_entries() {
        let mut log = DebugLog::default();
        for i in 0..80 {
            log.push(format!("entry {i}"));
        }
        assert_eq!(log.len(), DEBUG_LOG_CAPACITY);
        let first = log.entries().next().expect("non-empty");
        assert_eq!(first.message, "entry 30");
    }
}
