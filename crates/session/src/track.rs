//! Inbound agent audio: playback attachment and the analysis tap.

use crate::transport::RemoteAudioTrack;
use rustfft::{FftPlanner, num_complex::Complex32};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Number of frequency bands exposed to visualization consumers.
pub const SPECTRUM_BINS: usize = 32;

const FFT_SIZE: usize = 512;
const HOP: usize = FFT_SIZE / 2;

/// Mean band magnitude above which the agent counts as speaking.
const SPEAKING_THRESHOLD: f32 = 5e-4;

/// A non-owning handle onto the live frequency-domain data of the agent's
/// audio stream. Consumers hold a `Weak` reference; once the track
/// subscription ends, [`AnalyserTap::frequency_data`] returns `None`.
#[derive(Debug, Clone)]
pub struct AnalyserTap {
    bins: Weak<Mutex<Vec<f32>>>,
}

impl AnalyserTap {
    /// A snapshot of the current band magnitudes, or `None` once the
    /// underlying subscription has been released.
    pub fn frequency_data(&self) -> Option<Vec<f32>> {
        let bins = self.bins.upgrade()?;
        let guard = bins.lock().ok()?;
        Some(guard.clone())
    }

    pub fn is_live(&self) -> bool {
        self.bins.strong_count() > 0
    }
}

struct ActiveTrack {
    sid: String,
    bins: Arc<Mutex<Vec<f32>>>,
    task: JoinHandle<()>,
}

/// Attaches inbound agent audio and owns the single analysis tap.
pub struct RemoteTrackHandler {
    agent_prefix: String,
    active: Option<ActiveTrack>,
}

impl RemoteTrackHandler {
    pub fn new(agent_prefix: impl Into<String>) -> Self {
        Self {
            agent_prefix: agent_prefix.into(),
            active: None,
        }
    }

    /// Whether a participant identity matches the agent naming convention.
    pub fn is_agent(&self, identity: &str) -> bool {
        identity.starts_with(&self.agent_prefix)
    }

    /// Attaches an agent audio track: spawns the analysis task over its
    /// sample stream and returns a tap onto the shared spectrum.
    ///
    /// A second track while one is active replaces it; the prior task and
    /// its taps are torn down first so nothing leaks.
    pub fn attach(&mut self, track: RemoteAudioTrack, speaking: mpsc::Sender<bool>) -> AnalyserTap {
        if let Some(previous) = self.active.take() {
            debug!(sid = %previous.sid, "replacing active agent track");
            previous.task.abort();
        }

        let bins = Arc::new(Mutex::new(vec![0.0; SPECTRUM_BINS]));
        let tap = AnalyserTap {
            bins: Arc::downgrade(&bins),
        };
        let task = tokio::spawn(analyse(track.samples, bins.clone(), speaking));
        self.active = Some(ActiveTrack {
            sid: track.sid,
            bins,
            task,
        });
        tap
    }

    /// Releases the tap for `sid` if it is the active one. Returns whether
    /// anything was detached.
    pub fn detach(&mut self, sid: &str) -> bool {
        match &self.active {
            Some(active) if active.sid == sid => {
                if let Some(active) = self.active.take() {
                    active.task.abort();
                }
                true
            }
            _ => false,
        }
    }

    /// Tears down whatever is attached. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }

    pub fn active_sid(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.sid.as_str())
    }
}

impl Drop for RemoteTrackHandler {
    fn drop(&mut self) {
        self.release();
    }
}

/// Windowed FFT over the incoming sample stream. Publishes band magnitudes
/// into the shared spectrum and reports speaking-state edges.
async fn analyse(
    mut samples: mpsc::Receiver<Vec<f32>>,
    bins: Arc<Mutex<Vec<f32>>>,
    speaking: mpsc::Sender<bool>,
) {
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(FFT_SIZE);
    let mut window: Vec<f32> = Vec::with_capacity(FFT_SIZE * 2);
    let mut was_speaking = false;

    while let Some(chunk) = samples.recv().await {
        window.extend_from_slice(&chunk);
        while window.len() >= FFT_SIZE {
            let mut buffer: Vec<Complex32> = window[..FFT_SIZE]
                .iter()
                .enumerate()
                .map(|(i, &s)| {
                    // Hanning window to reduce spectral leakage
                    let w = 0.5
                        - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / FFT_SIZE as f32).cos();
                    Complex32::new(s * w, 0.0)
                })
                .collect();
            fft.process(&mut buffer);

            let per_bin = HOP / SPECTRUM_BINS;
            let scale = HOP as f32;
            let mut spectrum = vec![0.0f32; SPECTRUM_BINS];
            for (i, slot) in spectrum.iter_mut().enumerate() {
                let band = &buffer[i * per_bin..(i + 1) * per_bin];
                *slot = band.iter().map(|c| c.norm()).sum::<f32>() / per_bin as f32 / scale;
            }
            let energy = spectrum.iter().sum::<f32>() / SPECTRUM_BINS as f32;

            if let Ok(mut shared) = bins.lock() {
                shared.copy_from_slice(&spectrum);
            }

            let now_speaking = energy > SPEAKING_THRESHOLD;
            if now_speaking != was_speaking {
                was_speaking = now_speaking;
                if speaking.send(now_speaking).await.is_err() {
                    return;
                }
            }

            window.drain(..HOP);
        }
    }

    // Stream ended; make sure the indicator does not stick.
    if was_speaking {
        let _ = speaking.send(false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RemoteAudioTrack;

    /// Aborted analysis tasks release their spectrum buffer only once the
    /// runtime drops them; give it a few polls.
    async fn settled(tap: &AnalyserTap) -> bool {
        for _ in 0..100 {
            if !tap.is_live() {
                return true;
            }
            tokio::task::yield_now().await;
        }
        false
    }

    fn sine(len: usize, freq: f32, rate: f32, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin() * amplitude)
            .collect()
    }

    #[tokio::test]
    async fn loud_track_reports_speaking_and_fills_spectrum() {
        let (samples_tx, samples) = mpsc::channel(8);
        let (speaking_tx, mut speaking_rx) = mpsc::channel(8);
        let mut handler = RemoteTrackHandler::new("agent");
        let tap = handler.attach(
            RemoteAudioTrack {
                sid: "TR_1".into(),
                samples,
            },
            speaking_tx,
        );

        samples_tx
            .send(sine(FFT_SIZE * 2, 1000.0, 16000.0, 0.5))
            .await
            .expect("analysis task alive");

        assert_eq!(speaking_rx.recv().await, Some(true));
        let spectrum = tap.frequency_data().expect("tap live while attached");
        assert_eq!(spectrum.len(), SPECTRUM_BINS);
        assert!(spectrum.iter().any(|&m| m > 0.0));
    }

    #[tokio::test]
    async fn silence_never_reports_speaking() {
        let (samples_tx, samples) = mpsc::channel(8);
        let (speaking_tx, mut speaking_rx) = mpsc::channel(8);
        let mut handler = RemoteTrackHandler::new("agent");
        let _tap = handler.attach(
            RemoteAudioTrack {
                sid: "TR_1".into(),
                samples,
            },
            speaking_tx,
        );

        samples_tx
            .send(vec![0.0; FFT_SIZE * 2])
            .await
            .expect("analysis task alive");
        drop(samples_tx);

        // Channel closes without any speaking edge.
        assert_eq!(speaking_rx.recv().await, None);
    }

    #[tokio::test]
    async fn detach_invalidates_the_tap() {
        let (_samples_tx, samples) = mpsc::channel::<Vec<f32>>(8);
        let (speaking_tx, _speaking_rx) = mpsc::channel(8);
        let mut handler = RemoteTrackHandler::new("agent");
        let tap = handler.attach(
            RemoteAudioTrack {
                sid: "TR_1".into(),
                samples,
            },
            speaking_tx,
        );

        assert!(tap.is_live());
        assert!(!handler.detach("TR_other"));
        assert!(handler.detach("TR_1"));
        assert!(settled(&tap).await);
        assert!(tap.frequency_data().is_none());
    }

    #[tokio::test]
    async fn second_track_replaces_the_first() {
        let (_tx1, samples1) = mpsc::channel::<Vec<f32>>(8);
        let (_tx2, samples2) = mpsc::channel::<Vec<f32>>(8);
        let (speaking_tx, _speaking_rx) = mpsc::channel(8);
        let mut handler = RemoteTrackHandler::new("agent");

        let first = handler.attach(
            RemoteAudioTrack {
                sid: "TR_1".into(),
                samples: samples1,
            },
            speaking_tx.clone(),
        );
        let second = handler.attach(
            RemoteAudioTrack {
                sid: "TR_2".into(),
                samples: samples2,
            },
            speaking_tx,
        );

        assert!(settled(&first).await);
        assert!(second.is_live());
        assert_eq!(handler.active_sid(), Some("TR_2"));
    }

    #[test]
    fn agent_identity_prefix_match() {
        let handler = RemoteTrackHandler::new("agent");
        assert!(handler.is_agent("agent-main"));
        assert!(handler.is_agent("agent"));
        assert!(!handler.is_agent("user-ab12"));
    }
}
