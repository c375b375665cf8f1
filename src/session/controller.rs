use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::playback::{AudioOutput, PlaybackScheduler, SourceId};
use super::reconnect::{ReconnectDecision, ReconnectPolicy};
use super::status::{SessionSnapshot, SessionStatus, SessionUpdate};
use super::transcript::{FinalizeReason, FinalizedTurn, TranscriptAggregator, TurnId};
use crate::auth::CredentialProvider;
use crate::capture::{AudioCapturePipeline, VisionCapturePipeline};
use crate::error::SessionError;
use crate::media::{MediaAcquirer, MediaDevices};
use crate::persistence::{MessageStore, PersistenceWorker, Role};
use crate::transport::{
    CloseHandle, ServerMessage, TransportConnection, TransportConnector, TransportEvent,
    TransportSink,
};

const COMMAND_BUFFER: usize = 16;
const UPDATE_BUFFER: usize = 256;

/// Collaborators a session is built from
pub struct SessionDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn TransportConnector>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub store: Arc<dyn MessageStore>,
    pub output: Box<dyn AudioOutput>,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Start(Reply<()>),
    Stop(Reply<()>),
    Retry(Reply<()>),
}

enum Internal {
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    ReconnectDue {
        epoch: u64,
    },
}

/// Handle to the session controller task.
///
/// The controller owns every piece of session state; handles only send it
/// commands and observe its snapshot and update stream. Cloning is cheap.
/// When the last handle is dropped the session is stopped.
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionController {
    /// Spawn the controller task in the `idle` state.
    ///
    /// `config` should have passed `SessionConfig::validate`; pipelines clamp
    /// values they cannot run with.
    pub fn spawn(config: SessionConfig, deps: SessionDeps) -> Self {
        if let Err(e) = config.validate() {
            warn!(session_id = %config.session_id, "Session config is invalid: {:#}", e);
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::idle(&config.session_id));

        let (actor, inbox) =
            SessionActor::new(config, deps, command_rx, snapshot_tx, updates.clone());
        tokio::spawn(actor.run(inbox));

        Self {
            commands: command_tx,
            snapshot: snapshot_rx,
            updates,
        }
    }

    async fn request(
        &self,
        make: impl FnOnce(Reply<()>) -> Command,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::ControllerGone)?;
        rx.await.map_err(|_| SessionError::ControllerGone)?
    }

    /// Acquire devices and open a transport.
    ///
    /// Fails with `AlreadyActive` while a session is underway. Resolves once
    /// the transport attempt is underway; `active` follows when it opens.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.request(Command::Start).await
    }

    /// Tear everything down and return to `idle`.
    ///
    /// Any pending transcript turn is finalized and persisted before this
    /// resolves. Safe to call in any state.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(Command::Stop).await
    }

    /// Recover from `error`, re-requesting only devices that are not held
    pub async fn retry(&self) -> Result<(), SessionError> {
        self.request(Command::Retry).await
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot.borrow().status
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Observe snapshot changes
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to session updates from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }
}

struct ActiveTransport {
    generation: u64,
    sink: TransportSink,
    closer: CloseHandle,
    forwarder: JoinHandle<()>,
}

impl ActiveTransport {
    fn shutdown(self) {
        self.forwarder.abort();
        self.closer.close();
    }
}

struct SessionActor {
    config: SessionConfig,
    status: SessionStatus,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<SessionError>,
    stop_requested: bool,

    acquirer: MediaAcquirer,
    audio: AudioCapturePipeline,
    vision: VisionCapturePipeline,

    connector: Arc<dyn TransportConnector>,
    credentials: Arc<dyn CredentialProvider>,
    sink_tx: watch::Sender<Option<TransportSink>>,
    transport: Option<ActiveTransport>,
    generation: u64,

    reconnect: ReconnectPolicy,
    reconnect_timer: Option<JoinHandle<()>>,
    reconnect_epoch: u64,

    playback: PlaybackScheduler,
    transcript: TranscriptAggregator,
    persistence: PersistenceWorker,
    failures_reported: u64,

    snapshot_tx: watch::Sender<SessionSnapshot>,
    updates: broadcast::Sender<SessionUpdate>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

/// Everything the actor loop waits on
struct Inbox {
    commands: mpsc::Receiver<Command>,
    internal: mpsc::UnboundedReceiver<Internal>,
    timeouts: mpsc::UnboundedReceiver<TurnId>,
    completions: Option<mpsc::UnboundedReceiver<SourceId>>,
}

impl SessionActor {
    fn new(
        config: SessionConfig,
        deps: SessionDeps,
        commands: mpsc::Receiver<Command>,
        snapshot_tx: watch::Sender<SessionSnapshot>,
        updates: broadcast::Sender<SessionUpdate>,
    ) -> (Self, Inbox) {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (timeouts_tx, timeouts_rx) = mpsc::unbounded_channel();
        let (sink_tx, _) = watch::channel(None);

        let mut playback = PlaybackScheduler::new(deps.output, config.playback_sample_rate);
        let completions = playback.take_completions();
        if completions.is_none() {
            warn!("Audio output does not report ended sources; speaking state will not clear");
        }

        let actor = Self {
            status: SessionStatus::Idle,
            started_at: None,
            last_error: None,
            stop_requested: false,
            acquirer: MediaAcquirer::new(deps.devices),
            audio: AudioCapturePipeline::new(config.audio_capture()),
            vision: VisionCapturePipeline::new(config.vision_capture()),
            connector: deps.connector,
            credentials: deps.credentials,
            sink_tx,
            transport: None,
            generation: 0,
            reconnect: ReconnectPolicy::new(config.reconnect()),
            reconnect_timer: None,
            reconnect_epoch: 0,
            playback,
            transcript: TranscriptAggregator::new(config.transcript_timeout(), timeouts_tx),
            persistence: PersistenceWorker::spawn(deps.store),
            failures_reported: 0,
            snapshot_tx,
            updates,
            internal_tx,
            config,
        };
        let inbox = Inbox {
            commands,
            internal: internal_rx,
            timeouts: timeouts_rx,
            completions,
        };
        (actor, inbox)
    }

    async fn run(mut self, inbox: Inbox) {
        let Inbox {
            mut commands,
            mut internal,
            mut timeouts,
            mut completions,
        } = inbox;

        info!(session_id = %self.config.session_id, "Session controller started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = internal.recv() => self.handle_internal(event).await,
                Some(turn_id) = timeouts.recv() => {
                    if let Some(turn) = self.transcript.on_timeout(turn_id) {
                        self.emit(SessionUpdate::Warning {
                            message: SessionError::TranscriptTimeout.to_string(),
                        });
                        self.persist_turn(turn);
                    }
                }
                Some(id) = next_completion(&mut completions) => {
                    if self.playback.on_source_ended(id) {
                        self.emit(SessionUpdate::Speaking { speaking: false });
                    }
                }
            }

            self.publish_snapshot();
        }

        info!("All session handles dropped, shutting down");
        self.stop().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                self.stop().await;
                let _ = reply.send(Ok(()));
            }
            Command::Retry(reply) => {
                let result = self.retry().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Transport { generation, event } => {
                if self.transport.as_ref().map(|t| t.generation) != Some(generation) {
                    debug!(generation, "Ignoring event from stale transport");
                    return;
                }
                self.handle_transport_event(event);
            }
            Internal::ReconnectDue { epoch } => self.reconnect_due(epoch).await,
        }
    }

    async fn start(&mut self) -> Result<(), SessionError> {
        if self.status.is_live() {
            warn!("Start requested while session is {}", self.status);
            return Err(SessionError::AlreadyActive);
        }

        info!(session_id = %self.config.session_id, "Starting live session");
        self.started_at = Some(Utc::now());
        self.begin().await
    }

    async fn retry(&mut self) -> Result<(), SessionError> {
        if self.status != SessionStatus::Error {
            return Err(SessionError::InvalidState {
                operation: "retry",
                status: self.status,
            });
        }

        info!(session_id = %self.config.session_id, "Retrying live session");
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.begin().await
    }

    /// Shared path of start and retry: fresh reconnect budget, devices, connect
    async fn begin(&mut self) -> Result<(), SessionError> {
        self.stop_requested = false;
        self.cancel_reconnect_timer();
        self.reconnect.reset();
        self.last_error = None;

        self.set_status(SessionStatus::RequestingPermissions);
        self.acquire_devices().await?;
        self.connect().await
    }

    /// Ensure both devices are held, reusing live tracks.
    ///
    /// Both are attempted even when the first is denied, so a later retry
    /// only prompts for what is still missing.
    async fn acquire_devices(&mut self) -> Result<(), SessionError> {
        let video = self.acquirer.acquire_video().await.err();
        let audio = self.acquirer.acquire_audio().await.err();

        match video.or(audio) {
            Some(err) => {
                self.fail(err.clone());
                Err(err)
            }
            None => Ok(()),
        }
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        self.close_transport();
        self.set_status(SessionStatus::Connecting);

        let token = match self.credentials.bearer_token().await {
            Ok(token) => token,
            Err(e) => {
                let err = SessionError::Unauthorized(format!("{:#}", e));
                self.fail(err.clone());
                return Err(err);
            }
        };

        match self.connector.connect(&token).await {
            Ok(connection) => self.attach_transport(connection),
            Err(e) => {
                warn!("Failed to open transport: {:#}", e);
                self.on_transport_failure(SessionError::Transport(format!("{:#}", e)));
            }
        }
        Ok(())
    }

    fn attach_transport(&mut self, connection: TransportConnection) {
        self.generation += 1;
        let generation = self.generation;

        let TransportConnection {
            sink,
            mut events,
            closer,
        } = connection;

        let internal = self.internal_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if internal.send(Internal::Transport { generation, event }).is_err() {
                    break;
                }
            }
        });

        debug!(generation, "Transport attempt underway");
        self.transport = Some(ActiveTransport {
            generation,
            sink,
            closer,
            forwarder,
        });
    }

    /// Unpublish the sink and close the current transport, if any
    fn close_transport(&mut self) {
        self.sink_tx.send_replace(None);
        if let Some(transport) = self.transport.take() {
            debug!(generation = transport.generation, "Closing transport");
            transport.shutdown();
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Message(message) => self.on_message(message),
            TransportEvent::Error(info) => {
                self.on_transport_failure(SessionError::Transport(info));
            }
            TransportEvent::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "no reason given".to_string());
                self.on_transport_failure(SessionError::TransportClosedUnexpectedly(reason));
            }
        }
    }

    fn on_opened(&mut self) {
        let Some(sink) = self.transport.as_ref().map(|t| t.sink.clone()) else {
            return;
        };

        info!(
            session_id = %self.config.session_id,
            generation = self.generation,
            "Transport opened, session active"
        );
        self.reconnect.on_opened();
        self.sink_tx.send_replace(Some(sink));
        self.set_status(SessionStatus::Active);
        self.start_producers();
    }

    /// Attach both pipelines to the held tracks; running pipelines are kept
    fn start_producers(&mut self) {
        if let Some(track) = self.acquirer.audio() {
            if let Err(e) = self.audio.start(track, self.sink_tx.subscribe()) {
                error!("Failed to start audio capture: {:#}", e);
            }
        }
        if let Some(track) = self.acquirer.video() {
            self.vision.start(track, self.sink_tx.subscribe());
        }
    }

    fn on_message(&mut self, message: ServerMessage) {
        if message.interrupted() {
            self.interrupt_playback();
        }

        if let Some(payload) = message.audio_payload() {
            let was_speaking = self.playback.is_speaking();
            match self.playback.enqueue(payload) {
                Ok(_) if !was_speaking => self.emit(SessionUpdate::Speaking { speaking: true }),
                Ok(_) => {}
                Err(e) => {
                    warn!("Skipping audio chunk: {}", e);
                    self.emit(SessionUpdate::Warning {
                        message: e.to_string(),
                    });
                }
            }
        }

        if let Some(text) = message.input_text() {
            self.push_transcript(Role::User, text);
        }
        if let Some(text) = message.output_text() {
            self.push_transcript(Role::Assistant, text);
        }

        if message.turn_complete() {
            if let Some(turn) = self.transcript.finalize(FinalizeReason::Completed) {
                self.persist_turn(turn);
            }
        }
    }

    fn interrupt_playback(&mut self) {
        if self.playback.interrupt() > 0 {
            info!("Assistant interrupted, playback flushed");
            self.emit(SessionUpdate::Speaking { speaking: false });
        }
    }

    fn push_transcript(&mut self, role: Role, text: &str) {
        self.transcript.push_fragment(role, text);
        self.emit(SessionUpdate::Transcript {
            role,
            text: self.transcript.text(role),
            streaming: true,
        });
    }

    fn persist_turn(&mut self, turn: FinalizedTurn) {
        for message in &turn.messages {
            self.persistence.enqueue(message.clone(), &self.config.session_id);
        }
        self.emit(SessionUpdate::TurnFinalized {
            reason: turn.reason,
            messages: turn.messages,
        });
    }

    /// The current transport errored or closed without being asked to
    fn on_transport_failure(&mut self, err: SessionError) {
        let eligible = matches!(self.status, SessionStatus::Active | SessionStatus::Connecting)
            && !self.stop_requested;

        self.close_transport();

        if !eligible {
            debug!("Transport failure while {}: {}", self.status, err);
            return;
        }

        warn!(
            session_id = %self.config.session_id,
            generation = self.generation,
            "Transport failed: {}",
            err
        );

        // An attempt that was executing has now failed
        if self.status == SessionStatus::Connecting && self.reconnect.state().in_flight {
            self.reconnect.finish_attempt();
        }

        match self.reconnect.on_failure(err.to_string(), self.stop_requested) {
            ReconnectDecision::Schedule { attempt, delay } => {
                info!(
                    session_id = %self.config.session_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting"
                );
                self.set_status(SessionStatus::Reconnecting);
                self.emit(SessionUpdate::Reconnecting {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                self.schedule_reconnect(delay);
            }
            ReconnectDecision::AlreadyInFlight | ReconnectDecision::StopRequested => {}
            ReconnectDecision::Exhausted { attempts } => {
                self.fail(SessionError::Transport(format!(
                    "gave up after {} reconnect attempts: {}",
                    attempts, err
                )));
            }
        }
    }

    fn schedule_reconnect(&mut self, delay: std::time::Duration) {
        self.cancel_reconnect_timer();

        let epoch = self.reconnect_epoch;
        let internal = self.internal_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::ReconnectDue { epoch });
        }));
    }

    fn cancel_reconnect_timer(&mut self) {
        self.reconnect_epoch += 1;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    async fn reconnect_due(&mut self, epoch: u64) {
        if epoch != self.reconnect_epoch
            || self.stop_requested
            || self.status != SessionStatus::Reconnecting
        {
            debug!("Discarding stale reconnect");
            return;
        }
        self.reconnect_timer = None;

        info!(
            session_id = %self.config.session_id,
            attempt = self.reconnect.state().attempt,
            "Reconnect attempt starting"
        );

        // Devices may have been lost while disconnected
        if self.acquire_devices().await.is_err() {
            return;
        }
        let _ = self.connect().await;
    }

    /// Move to `error`, keeping held devices so retry can reuse them
    fn fail(&mut self, err: SessionError) {
        error!(session_id = %self.config.session_id, "Live session failed: {}", err);

        self.cancel_reconnect_timer();
        self.reconnect.cancel();
        self.close_transport();
        self.audio.stop();
        self.vision.stop();

        self.last_error = Some(err);
        self.set_status(SessionStatus::Error);
    }

    async fn stop(&mut self) {
        if self.status == SessionStatus::Idle && self.transport.is_none() {
            debug!("Stop requested while idle");
            self.stop_requested = true;
            return;
        }

        info!(session_id = %self.config.session_id, "Stopping live session");
        self.stop_requested = true;
        self.cancel_reconnect_timer();
        self.reconnect.cancel();

        if let Some(turn) = self.transcript.finalize(FinalizeReason::Stopped) {
            self.persist_turn(turn);
        }
        self.persistence.flush().await;

        self.audio.stop();
        self.vision.stop();
        self.close_transport();

        if self.playback.shutdown() > 0 {
            self.emit(SessionUpdate::Speaking { speaking: false });
        }
        self.acquirer.release_all();

        self.last_error = None;
        self.started_at = None;
        self.set_status(SessionStatus::Idle);

        let failures = self.persistence.failures();
        if failures > self.failures_reported {
            let err = SessionError::Persistence(format!(
                "{} messages could not be saved",
                failures - self.failures_reported
            ));
            warn!(session_id = %self.config.session_id, "{}", err);
            self.emit(SessionUpdate::Warning {
                message: err.to_string(),
            });
            self.failures_reported = failures;
        }
        info!(session_id = %self.config.session_id, "Live session stopped");
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status == status {
            return;
        }
        debug!("Session status {} -> {}", self.status, status);
        self.status = status;

        let error = match status {
            SessionStatus::Error => self.last_error.clone(),
            _ => None,
        };
        self.emit(SessionUpdate::Status { status, error });
        self.publish_snapshot();
    }

    fn emit(&self, update: SessionUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            status: self.status,
            session_id: self.config.session_id.clone(),
            started_at: self.started_at,
            reconnect_attempt: self.reconnect.state().attempt,
            last_error: self.last_error.clone(),
            speaking: self.playback.is_speaking(),
            devices: self.acquirer.held(),
            user_transcript: self.transcript.text(Role::User),
            assistant_transcript: self.transcript.text(Role::Assistant),
            audio_frames_sent: self.audio.frames_sent(),
            audio_frames_dropped: self.audio.frames_dropped(),
            vision_frames_sent: self.vision.frames_sent(),
            vision_ticks_skipped: self.vision.ticks_skipped(),
        });
    }
}

async fn next_completion(rx: &mut Option<mpsc::UnboundedReceiver<SourceId>>) -> Option<SourceId> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
