//! The session lifecycle controller.
//!
//! One actor task owns every piece of mutable session state: the connection
//! record, the indicators, the debug log, the live transport session, the
//! microphone, the analysis tap and all named timers. Collaborators and the
//! host talk to it exclusively over channels, so ordering is explicit and
//! the single in-flight boolean is the only guard the model needs.

use crate::config::Config;
use crate::credential::CredentialProvider;
use crate::device::MicrophoneManager;
use crate::error::SessionError;
use crate::events::{self, InboundEvent, MEMORY_INDICATOR_TTL, TOOL_INDICATOR_TTL};
use crate::state::{
    ConnectionState, DebugLog, IndicatorState, LogEntry, MemoryIndicator, SessionSnapshot, Status,
    Transition,
};
use crate::track::{AnalyserTap, RemoteTrackHandler};
use crate::transport::{Transport, TransportEvent, TransportSession, USER_INITIATED};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

/// Tunables the controller needs from the wider configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub agent_identity_prefix: String,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            agent_identity_prefix: "agent".to_string(),
            connect_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

impl From<&Config> for ControllerConfig {
    fn from(config: &Config) -> Self {
        Self {
            agent_identity_prefix: config.agent_identity_prefix.clone(),
            connect_timeout: config.connect_timeout,
            reconnect_delay: config.reconnect_delay,
        }
    }
}

/// Host-facing commands.
#[derive(Debug)]
enum SessionCommand {
    Connect { preset: Option<String> },
    Disconnect,
    ToggleMute,
    RetryMicrophone,
    AnalyserTap { reply: oneshot::Sender<Option<AnalyserTap>> },
    DebugLog { reply: oneshot::Sender<Vec<LogEntry>> },
    Shutdown,
}

/// Handle to the running controller actor.
pub struct SessionController {
    commands: mpsc::Sender<SessionCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionController {
    /// Spawns the controller actor.
    pub fn spawn(
        config: ControllerConfig,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshots) = watch::channel(SessionSnapshot::default());
        let (internal_tx, internal_rx) = mpsc::channel(64);
        let (speaking_tx, speaking_rx) = mpsc::channel(16);

        let actor = SessionActor {
            tracks: RemoteTrackHandler::new(config.agent_identity_prefix.clone()),
            config,
            credentials,
            transport,
            state: ConnectionState::default(),
            indicators: IndicatorState::default(),
            log: DebugLog::default(),
            snapshot_tx,
            internal_tx,
            speaking_tx,
            timers: Timers::default(),
            generation: 0,
            connect_in_flight: false,
            reconnect_guard: false,
            attempt: None,
            session: None,
            microphone: MicrophoneManager::new(),
            tap: None,
            last_preset: None,
        };
        let task = tokio::spawn(
            actor
                .run(command_rx, internal_rx, speaking_rx)
                .instrument(info_span!("session")),
        );

        Self {
            commands: command_tx,
            snapshots,
            task,
        }
    }

    /// Requests a connect. Ignored while an attempt is already in flight.
    pub async fn connect(&self, preset: Option<String>) {
        let _ = self
            .commands
            .send(SessionCommand::Connect { preset })
            .await;
    }

    /// User-initiated disconnect with full teardown. Never schedules a
    /// reconnect.
    pub async fn disconnect(&self) {
        let _ = self.commands.send(SessionCommand::Disconnect).await;
    }

    pub async fn toggle_mute(&self) {
        let _ = self.commands.send(SessionCommand::ToggleMute).await;
    }

    /// Re-attempts microphone acquisition on a degraded session.
    pub async fn retry_microphone(&self) {
        let _ = self.commands.send(SessionCommand::RetryMicrophone).await;
    }

    /// The analysis tap over the agent's audio, while one is attached.
    pub async fn analyser_tap(&self) -> Option<AnalyserTap> {
        let (reply, tap) = oneshot::channel();
        self.commands
            .send(SessionCommand::AnalyserTap { reply })
            .await
            .ok()?;
        tap.await.ok().flatten()
    }

    /// The rolling debug log (most recent 50 lifecycle messages).
    pub async fn debug_log(&self) -> Vec<LogEntry> {
        let (reply, entries) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::DebugLog { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        entries.await.unwrap_or_default()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A watch receiver over every published snapshot.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Tears the session down and stops the actor.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

/// Named, cancellable delayed actions owned by the actor. Any transition
/// that supersedes a timer aborts it, so nothing stale ever fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    ConnectTimeout,
    Reconnect,
    MemoryHide,
    ToolHide,
}

#[derive(Default)]
struct Timers {
    handles: HashMap<TimerKind, JoinHandle<()>>,
}

impl Timers {
    fn arm(
        &mut self,
        kind: TimerKind,
        generation: u64,
        delay: Duration,
        tx: mpsc::Sender<InternalEvent>,
    ) {
        self.cancel(kind);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(InternalEvent::TimerFired { generation, kind })
                .await;
        });
        self.handles.insert(kind, handle);
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(handle) = self.handles.remove(&kind) {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }
}

/// Completions reported back to the actor, tagged with the attempt
/// generation they were started under. A generation mismatch means the
/// attempt was superseded and the completion is dropped.
enum InternalEvent {
    TokenAcquired {
        generation: u64,
        room: String,
    },
    TransportEstablished {
        generation: u64,
        session: TransportSession,
    },
    AttemptFailed {
        generation: u64,
        error: SessionError,
    },
    TimerFired {
        generation: u64,
        kind: TimerKind,
    },
}

struct SessionActor {
    config: ControllerConfig,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn Transport>,
    state: ConnectionState,
    indicators: IndicatorState,
    log: DebugLog,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    internal_tx: mpsc::Sender<InternalEvent>,
    speaking_tx: mpsc::Sender<bool>,
    timers: Timers,
    /// Bumped on every teardown and connect; stale completions carry an
    /// older value and are ignored.
    generation: u64,
    /// The single synchronization primitive: one connect attempt at a time.
    connect_in_flight: bool,
    /// Set while the one automatic reconnect is pending or underway;
    /// a second unexpected drop in that window escalates instead of
    /// retrying again.
    reconnect_guard: bool,
    attempt: Option<JoinHandle<()>>,
    session: Option<TransportSession>,
    microphone: MicrophoneManager,
    tracks: RemoteTrackHandler,
    tap: Option<AnalyserTap>,
    last_preset: Option<String>,
}

enum Flow {
    Continue,
    Stop,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut internal: mpsc::Receiver<InternalEvent>,
        mut speaking: mpsc::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if let Flow::Stop = self.handle_command(cmd).await {
                            break;
                        }
                    }
                    // Host dropped the controller handle.
                    None => break,
                },
                Some(event) = internal.recv() => self.handle_internal(event).await,
                Some(active) = speaking.recv() => {
                    if self.indicators.agent_speaking != active {
                        self.indicators.agent_speaking = active;
                        self.publish();
                    }
                }
                event = next_transport_event(self.session.as_mut()) => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        self.handle_disconnect("transport channel closed".to_string()).await;
                    }
                },
            }
        }
        self.teardown("Controller shut down").await;
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Connect { preset } => {
                self.start_connect(preset).await;
            }
            SessionCommand::Disconnect => {
                info!("user-initiated disconnect");
                self.teardown("Disconnected").await;
            }
            SessionCommand::ToggleMute => {
                if let Some(session) = &self.session {
                    let muted = self.microphone.toggle_mute(&session.handle).await;
                    self.log
                        .push(if muted { "Microphone muted" } else { "Microphone unmuted" });
                    self.publish();
                }
            }
            SessionCommand::RetryMicrophone => {
                if self.state.transport_connected {
                    self.acquire_microphone().await;
                }
            }
            SessionCommand::AnalyserTap { reply } => {
                let _ = reply.send(self.tap.clone());
            }
            SessionCommand::DebugLog { reply } => {
                let _ = reply.send(self.log.entries().cloned().collect());
            }
            SessionCommand::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    /// Begins a connect attempt: preflight, then credential and transport
    /// in a spawned task so the actor keeps processing events and timers.
    async fn start_connect(&mut self, preset: Option<String>) {
        if self.connect_in_flight {
            self.log.push("Connect ignored: attempt already in flight");
            debug!("connect rejected by in-flight guard");
            return;
        }
        if self.state.status == Status::Connected {
            self.log.push("Connect ignored: already connected");
            return;
        }

        if let Err(e) = self.transport.preflight() {
            self.fail(e).await;
            return;
        }

        self.connect_in_flight = true;
        self.generation += 1;
        let generation = self.generation;
        self.last_preset = preset.clone();

        self.state.apply(Transition::ConnectRequested);
        self.log.push(match &preset {
            Some(preset) => format!("Connecting (preset {preset})"),
            None => "Connecting".to_string(),
        });
        self.publish();

        self.timers.arm(
            TimerKind::ConnectTimeout,
            generation,
            self.config.connect_timeout,
            self.internal_tx.clone(),
        );

        let credentials = self.credentials.clone();
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        self.attempt = Some(tokio::spawn(async move {
            let credential = match credentials.issue(preset).await {
                Ok(credential) => credential,
                Err(error) => {
                    let _ = tx.send(InternalEvent::AttemptFailed { generation, error }).await;
                    return;
                }
            };
            if tx
                .send(InternalEvent::TokenAcquired {
                    generation,
                    room: credential.room.clone(),
                })
                .await
                .is_err()
            {
                return;
            }
            match transport
                .connect(&credential.transport_url, &credential.token)
                .await
            {
                Ok(session) => {
                    let _ = tx
                        .send(InternalEvent::TransportEstablished { generation, session })
                        .await;
                }
                Err(error) => {
                    let _ = tx.send(InternalEvent::AttemptFailed { generation, error }).await;
                }
            }
        }));
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::TokenAcquired { generation, room } => {
                if self.is_stale(generation) {
                    debug!("ignoring stale token completion");
                    return;
                }
                self.state.apply(Transition::TokenAcquired);
                self.log.push(format!("Credential acquired for room {room}"));
                self.publish();
            }
            InternalEvent::TransportEstablished {
                generation,
                session,
            } => {
                if self.is_stale(generation) {
                    debug!("ignoring stale transport completion");
                    // The handshake succeeded after cleanup; release it.
                    session.handle.disconnect().await;
                    return;
                }
                self.session = Some(session);
                // The state transition waits for the transport's own
                // Connected notification on the event stream.
            }
            InternalEvent::AttemptFailed { generation, error } => {
                if self.is_stale(generation) {
                    debug!("ignoring stale attempt failure");
                    return;
                }
                self.fail(error).await;
            }
            InternalEvent::TimerFired { generation, kind } => {
                if self.is_stale(generation) {
                    debug!(?kind, "ignoring stale timer");
                    return;
                }
                self.handle_timer(kind).await;
            }
        }
    }

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ConnectTimeout => {
                warn!("connect attempt timed out");
                self.fail(SessionError::ConnectionTimeout(
                    self.config.connect_timeout.as_secs(),
                ))
                .await;
            }
            TimerKind::Reconnect => {
                info!("reconnect delay elapsed, retrying with last preset");
                let preset = self.last_preset.clone();
                self.start_connect(preset).await;
            }
            TimerKind::MemoryHide => {
                self.indicators.memory = None;
                self.publish();
            }
            TimerKind::ToolHide => {
                self.indicators.tool = None;
                self.publish();
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.state.apply(Transition::TransportConnected);
                self.log.push("Transport connected");
                self.publish();
                self.acquire_microphone().await;
            }
            TransportEvent::ParticipantJoined { identity } => {
                if self.tracks.is_agent(&identity) {
                    self.state.apply(Transition::RemoteJoined);
                    self.log.push(format!("Agent {identity} joined"));
                    self.settle_attempt();
                    self.publish();
                } else {
                    debug!(%identity, "non-agent participant joined");
                }
            }
            TransportEvent::ParticipantLeft { identity } => {
                if self.tracks.is_agent(&identity) {
                    self.state.apply(Transition::RemoteLeft);
                    self.log.push(format!("Agent {identity} left"));
                    self.publish();
                }
            }
            TransportEvent::TrackSubscribed { track, participant } => {
                if self.tracks.is_agent(&participant) {
                    let sid = track.sid.clone();
                    self.tap = Some(self.tracks.attach(track, self.speaking_tx.clone()));
                    self.log.push(format!("Agent audio track {sid} attached"));
                    self.publish();
                } else {
                    debug!(%participant, "ignoring non-agent track");
                }
            }
            TransportEvent::TrackUnsubscribed { sid, participant } => {
                if self.tracks.detach(&sid) {
                    self.tap = None;
                    self.indicators.agent_speaking = false;
                    self.log
                        .push(format!("Agent audio track {sid} released ({participant})"));
                    self.publish();
                }
            }
            TransportEvent::DataReceived { payload, .. } => {
                self.handle_data(&payload);
            }
            TransportEvent::Disconnected { reason } => {
                self.handle_disconnect(reason).await;
            }
            TransportEvent::Reconnecting => {
                self.log.push("Transport reconnecting");
                self.publish();
            }
            TransportEvent::Reconnected => {
                self.log.push("Transport reconnected");
                self.publish();
            }
            TransportEvent::LocalTrackPublished => {
                debug!("local track published");
            }
            TransportEvent::LocalTrackUnpublished => {
                debug!("local track unpublished");
            }
            TransportEvent::StateChanged(state) => {
                debug!(?state, "transport state changed");
            }
        }
    }

    fn handle_data(&mut self, payload: &[u8]) {
        match events::decode(payload) {
            Ok(InboundEvent::Memory { kind, message }) => {
                self.indicators.memory = Some(MemoryIndicator { kind, message });
                self.timers.arm(
                    TimerKind::MemoryHide,
                    self.generation,
                    MEMORY_INDICATOR_TTL,
                    self.internal_tx.clone(),
                );
                self.publish();
            }
            Ok(InboundEvent::Tool { label }) => {
                self.indicators.tool = Some(label);
                self.timers.arm(
                    TimerKind::ToolHide,
                    self.generation,
                    TOOL_INDICATOR_TTL,
                    self.internal_tx.clone(),
                );
                self.publish();
            }
            Ok(InboundEvent::MemoryFallback) => {
                self.indicators.memory_fallback = true;
                self.log.push("Memory fallback engaged");
                self.publish();
            }
            Ok(InboundEvent::Unknown { kind }) => {
                debug!(%kind, "ignoring unknown data event");
            }
            Err(e) => {
                warn!(error = %e, "dropping undecodable data packet");
                self.log.push(e.to_string());
            }
        }
    }

    /// Classifies a disconnect and applies the reconnect policy.
    async fn handle_disconnect(&mut self, reason: String) {
        if reason == USER_INITIATED {
            info!("transport reported user-initiated disconnect");
            self.teardown("Disconnected").await;
            return;
        }

        let error = SessionError::UnexpectedDisconnect(reason.clone());
        if self.reconnect_guard {
            // Second unexpected drop inside the retry window: stop the
            // storm and surface the error.
            warn!(%reason, "repeat disconnect during reconnect window");
            self.fail(error).await;
            return;
        }

        if self.state.status == Status::Connected {
            warn!(%reason, "unexpected disconnect, scheduling single reconnect");
            self.log.push(format!("{error}"));
            self.release_resources().await;
            self.generation += 1;
            self.connect_in_flight = false;
            self.reconnect_guard = true;
            self.state.apply(Transition::ReconnectScheduled(
                "Connection lost, reconnecting".to_string(),
            ));
            self.indicators = IndicatorState::default();
            self.timers.arm(
                TimerKind::Reconnect,
                self.generation,
                self.config.reconnect_delay,
                self.internal_tx.clone(),
            );
            self.publish();
        } else {
            // Dropped before the session was ever fully connected.
            self.fail(error).await;
        }
    }

    async fn acquire_microphone(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        match self.microphone.acquire(&session.handle).await {
            Ok(()) => {
                self.state.apply(Transition::MicrophoneEnabled);
                self.log.push("Microphone enabled");
                self.settle_attempt();
            }
            Err(e) => {
                // Degrade, keep the transport session alive.
                warn!(error = %e, "microphone acquisition failed, session degraded");
                self.log.push(e.to_string());
                self.state
                    .apply(Transition::MicrophoneDegraded(e.to_string()));
            }
        }
        self.publish();
    }

    /// Concludes the attempt once the externally visible "connected"
    /// milestone is reached: transport up and agent joined. The reconnect
    /// guard clears only on full readiness, so a session that drops again
    /// before becoming ready still counts as inside the retry window.
    fn settle_attempt(&mut self) {
        if self.state.transport_connected && self.state.remote_joined {
            if self.connect_in_flight {
                self.connect_in_flight = false;
                self.timers.cancel(TimerKind::ConnectTimeout);
            }
            if self.state.status == Status::Connected && self.reconnect_guard {
                self.reconnect_guard = false;
                self.log.push("Reconnect succeeded");
            }
        }
    }

    /// Fatal failure: full cleanup, then `Error` with the distinct message.
    async fn fail(&mut self, error: SessionError) {
        let message = error.to_string();
        self.log.push(&message);
        self.release_resources().await;
        self.generation += 1;
        self.connect_in_flight = false;
        self.reconnect_guard = false;
        self.indicators = IndicatorState::default();
        self.state.apply(Transition::Failed(message));
        self.publish();
    }

    /// Forced teardown from any state back to the initial record.
    async fn teardown(&mut self, message: &str) {
        self.release_resources().await;
        self.generation += 1;
        self.connect_in_flight = false;
        self.reconnect_guard = false;
        self.last_preset = None;
        self.indicators = IndicatorState::default();
        self.state.apply(Transition::Teardown);
        self.log.push(message);
        self.publish();
    }

    /// Releases every held resource: the attempt task, all timers, the
    /// analysis tap and the transport session itself.
    async fn release_resources(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        self.timers.cancel_all();
        self.tracks.release();
        self.tap = None;
        self.microphone.release();
        if let Some(session) = self.session.take() {
            session.handle.disconnect().await;
        }
    }

    fn is_stale(&self, generation: u64) -> bool {
        generation != self.generation
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            connection: self.state.clone(),
            indicators: self.indicators.clone(),
        });
    }
}

async fn next_transport_event(session: Option<&mut TransportSession>) -> Option<TransportEvent> {
    match session {
        Some(session) => session.events.recv().await,
        None => std::future::pending().await,
    }
}
