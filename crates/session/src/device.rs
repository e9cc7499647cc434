//! Local microphone ownership and mute state.

use crate::error::SessionError;
use crate::transport::TransportHandle;
use tracing::debug;

/// Owns the outbound microphone publication for the active session.
///
/// Acquisition happens strictly after the transport reports connected; a
/// failure degrades the session instead of ending it, and the publication
/// dies with the transport session on release.
#[derive(Debug, Default)]
pub struct MicrophoneManager {
    acquired: bool,
    muted: bool,
}

impl MicrophoneManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the microphone track through the live session.
    ///
    /// Idempotent; re-acquiring an already published microphone is a no-op.
    /// Mute state set while degraded carries over to the publication.
    pub async fn acquire(&mut self, handle: &TransportHandle) -> Result<(), SessionError> {
        if self.acquired {
            return Ok(());
        }
        handle.publish_microphone().await?;
        self.acquired = true;
        if self.muted {
            handle.set_microphone_enabled(false).await;
        }
        debug!(muted = self.muted, "microphone published");
        Ok(())
    }

    /// Flips the mute flag and reflects it onto the publication.
    /// No-op while the microphone is not acquired.
    pub async fn toggle_mute(&mut self, handle: &TransportHandle) -> bool {
        if !self.acquired {
            return self.muted;
        }
        self.muted = !self.muted;
        handle.set_microphone_enabled(!self.muted).await;
        self.muted
    }

    /// Forgets the publication. Called on teardown; the transport session
    /// itself releases the track.
    pub fn release(&mut self) {
        self.acquired = false;
        self.muted = false;
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportCommand, TransportHandle};
    use tokio::sync::mpsc;

    /// Answers publish requests the way a live transport would.
    fn acked_handle(grant: bool) -> TransportHandle {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if let TransportCommand::PublishMicrophone { ack } = cmd {
                    let reply = if grant {
                        Ok(())
                    } else {
                        Err("permission denied".to_string())
                    };
                    let _ = ack.send(reply);
                }
            }
        });
        TransportHandle::new(tx)
    }

    #[tokio::test]
    async fn acquire_publishes_once() {
        let handle = acked_handle(true);
        let mut mic = MicrophoneManager::new();

        mic.acquire(&handle).await.expect("first acquire");
        assert!(mic.is_acquired());
        mic.acquire(&handle).await.expect("re-acquire is a no-op");
    }

    #[tokio::test]
    async fn failed_acquire_reports_unavailable_and_stays_released() {
        let handle = acked_handle(false);
        let mut mic = MicrophoneManager::new();

        let err = mic.acquire(&handle).await.unwrap_err();
        assert!(matches!(err, SessionError::MicrophoneUnavailable(_)));
        assert!(!mic.is_acquired());
    }

    #[tokio::test]
    async fn mute_is_a_noop_until_acquired() {
        let handle = acked_handle(true);
        let mut mic = MicrophoneManager::new();

        assert!(!mic.toggle_mute(&handle).await);
        assert!(!mic.is_muted());

        mic.acquire(&handle).await.expect("acquire");
        assert!(mic.toggle_mute(&handle).await);
        assert!(mic.is_muted());
        assert!(!mic.toggle_mute(&handle).await);
    }

    #[tokio::test]
    async fn release_resets_state() {
        let handle = acked_handle(true);
        let mut mic = MicrophoneManager::new();
        mic.acquire(&handle).await.expect("acquire");
        mic.toggle_mute(&handle).await;

        mic.release();
        assert!(!mic.is_acquired());
        assert!(!mic.is_muted());
    }
}
