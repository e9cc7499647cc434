//! Error taxonomy for the session lifecycle.

use thiserror::Error;

/// Everything that can go wrong between a connect request and a live session.
///
/// Each variant carries a distinct, user-presentable message; the controller
/// surfaces them verbatim on the status record and appends them to the
/// debug log.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The credential endpoint could not produce a usable credential.
    /// Network failures, non-success statuses and incomplete response
    /// bodies all fold into this one variant.
    #[error("failed to acquire session credential: {0}")]
    TokenAcquisition(String),

    /// The transport handshake failed before the session was established.
    #[error("transport connection failed: {0}")]
    TransportConnect(String),

    /// No ready session within the attempt window. Distinct from a protocol
    /// failure so the host can tell "slow" apart from "broken".
    #[error("connection attempt timed out after {0} seconds")]
    ConnectionTimeout(u64),

    /// The local microphone could not be published. Degrades the session
    /// instead of ending it.
    #[error("microphone unavailable: {0}")]
    MicrophoneUnavailable(String),

    /// A malformed data-channel packet. Logged and dropped, never fatal.
    #[error("undecodable data packet: {0}")]
    Decode(String),

    /// The transport dropped for a reason other than "user-initiated".
    #[error("connection lost unexpectedly: {0}")]
    UnexpectedDisconnect(String),
}

impl SessionError {
    /// Whether this error ends the attempt or merely degrades the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Decode(_) | Self::MicrophoneUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_distinct_and_actionable() {
        let errors = [
            SessionError::TokenAcquisition("endpoint returned 500".into()),
            SessionError::TransportConnect("dns lookup failed".into()),
            SessionError::ConnectionTimeout(30),
            SessionError::MicrophoneUnavailable("permission denied".into()),
            SessionError::Decode("invalid utf-8".into()),
            SessionError::UnexpectedDisconnect("network".into()),
        ];
        let rendered: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        for (i, msg) in rendered.iter().enumerate() {
            assert!(!msg.to_lowercase().contains("connecting"), "{msg}");
            for other in &rendered[i + 1..] {
                assert_ne!(msg, other);
            }
        }
    }

    #[test]
    fn decode_and_microphone_failures_are_non_fatal() {
        assert!(!SessionError::Decode("bad json".into()).is_fatal());
        assert!(!SessionError::MicrophoneUnavailable("busy".into()).is_fatal());
        assert!(SessionError::ConnectionTimeout(30).is_fatal());
        assert!(SessionError::TokenAcquisition("nope".into()).is_fatal());
    }
}
