// Test doubles for the live session collaborators
//
// Devices, transport, and audio output are replaced by in-process fakes the
// tests can drive directly. Each connection attempt hands its remote-facing
// peer to the test over a channel.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use live_session::session::{AudioOutput, PcmBuffer, SourceId};
use live_session::transport::{
    ServerMessage, TransportConnection, TransportConnector, TransportEvent, TransportPeer,
};
use live_session::{
    AudioTrack, DeviceError, DeviceKind, MediaDevices, MediaTrack, MemoryMessageStore, RawImage,
    SampleBlock, SessionConfig, SessionController, SessionDeps, SessionStatus, SessionUpdate,
    StaticCredential, VideoTrack,
};
use tokio::sync::{broadcast, mpsc};

pub const SESSION_ID: &str = "test-session";
pub const TOKEN: &str = "test-token";

// ============================================================================
// Devices
// ============================================================================

pub struct FakeAudioTrack {
    live: AtomicBool,
    readers: Mutex<Vec<mpsc::Sender<SampleBlock>>>,
}

impl FakeAudioTrack {
    fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Deliver a block to every attached reader
    pub fn feed(&self, block: SampleBlock) {
        for reader in self.readers.lock().unwrap().iter() {
            let _ = reader.try_send(block.clone());
        }
    }

    pub fn reader_count(&self) -> usize {
        self.readers.lock().unwrap().len()
    }
}

impl MediaTrack for FakeAudioTrack {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Microphone
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.readers.lock().unwrap().clear();
    }

    fn label(&self) -> &str {
        "fake-microphone"
    }
}

impl AudioTrack for FakeAudioTrack {
    fn open_reader(&self) -> Result<mpsc::Receiver<SampleBlock>> {
        if !self.is_live() {
            bail!("track stopped");
        }
        let (tx, rx) = mpsc::channel(64);
        self.readers.lock().unwrap().push(tx);
        Ok(rx)
    }
}

pub struct FakeVideoTrack {
    live: AtomicBool,
}

impl MediaTrack for FakeVideoTrack {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Video
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn label(&self) -> &str {
        "fake-camera"
    }
}

impl VideoTrack for FakeVideoTrack {
    fn grab_frame(&self) -> Option<RawImage> {
        self.is_live().then(|| RawImage {
            width: 8,
            height: 8,
            pixels: vec![128; 8 * 8 * 3],
        })
    }
}

#[derive(Default)]
pub struct FakeDevices {
    pub deny_video: AtomicBool,
    pub deny_audio: AtomicBool,
    pub video_requests: AtomicUsize,
    pub audio_requests: AtomicUsize,
    pub video_tracks: Mutex<Vec<Arc<FakeVideoTrack>>>,
    pub audio_tracks: Mutex<Vec<Arc<FakeAudioTrack>>>,
}

impl FakeDevices {
    pub fn latest_audio(&self) -> Option<Arc<FakeAudioTrack>> {
        self.audio_tracks.lock().unwrap().last().cloned()
    }

    pub fn latest_video(&self) -> Option<Arc<FakeVideoTrack>> {
        self.video_tracks.lock().unwrap().last().cloned()
    }
}

#[async_trait::async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire_video(&self) -> Result<Arc<dyn VideoTrack>, DeviceError> {
        self.video_requests.fetch_add(1, Ordering::SeqCst);
        if self.deny_video.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied);
        }
        let track = Arc::new(FakeVideoTrack {
            live: AtomicBool::new(true),
        });
        self.video_tracks.lock().unwrap().push(track.clone());
        Ok(track)
    }

    async fn acquire_audio(&self) -> Result<Arc<dyn AudioTrack>, DeviceError> {
        self.audio_requests.fetch_add(1, Ordering::SeqCst);
        if self.deny_audio.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied);
        }
        let track = Arc::new(FakeAudioTrack::new());
        self.audio_tracks.lock().unwrap().push(track.clone());
        Ok(track)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Hands every connection attempt's peer to the test
pub struct ScriptedConnector {
    peers: mpsc::UnboundedSender<TransportPeer>,
    pub attempts: AtomicUsize,
    pub tokens: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                peers: tx,
                attempts: AtomicUsize::new(0),
                tokens: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }
}

#[async_trait::async_trait]
impl TransportConnector for ScriptedConnector {
    async fn connect(&self, credential: &str) -> Result<TransportConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(credential.to_string());

        let (connection, peer) = TransportConnection::pair(64);
        let _ = self.peers.send(peer);
        Ok(connection)
    }
}

pub fn server_message(json: serde_json::Value) -> TransportEvent {
    let message: ServerMessage = serde_json::from_value(json).unwrap();
    TransportEvent::Message(message)
}

pub fn audio_chunk(samples: usize) -> TransportEvent {
    use base64::Engine;
    let data = base64::engine::general_purpose::STANDARD.encode(vec![0u8; samples * 2]);
    server_message(serde_json::json!({
        "serverContent": {
            "modelTurn": { "parts": [ { "inlineData": { "data": data, "mimeType": "audio/pcm;rate=24000" } } ] }
        }
    }))
}

pub fn input_text(text: &str) -> TransportEvent {
    server_message(serde_json::json!({
        "serverContent": { "inputTranscription": { "text": text } }
    }))
}

pub fn output_text(text: &str) -> TransportEvent {
    server_message(serde_json::json!({
        "serverContent": { "outputTranscription": { "text": text } }
    }))
}

pub fn turn_complete() -> TransportEvent {
    server_message(serde_json::json!({ "serverContent": { "turnComplete": true } }))
}

pub fn interrupted() -> TransportEvent {
    server_message(serde_json::json!({ "serverContent": { "interrupted": true } }))
}

// ============================================================================
// Audio output
// ============================================================================

#[derive(Default)]
pub struct OutputLog {
    pub now: f64,
    pub started: Vec<(SourceId, f64, usize)>,
    pub stopped: Vec<SourceId>,
}

/// Output with a hand-driven clock
pub struct ManualOutput {
    log: Arc<Mutex<OutputLog>>,
    ended: Option<mpsc::UnboundedReceiver<SourceId>>,
}

/// Test-side view of a `ManualOutput`
#[derive(Clone)]
pub struct OutputMonitor {
    pub log: Arc<Mutex<OutputLog>>,
    ended: mpsc::UnboundedSender<SourceId>,
}

impl OutputMonitor {
    pub fn set_now(&self, now: f64) {
        self.log.lock().unwrap().now = now;
    }

    /// Report a source as finished playing
    pub fn end(&self, id: SourceId) {
        let _ = self.ended.send(id);
    }

    pub fn started(&self) -> Vec<(SourceId, f64, usize)> {
        self.log.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<SourceId> {
        self.log.lock().unwrap().stopped.clone()
    }
}

pub fn manual_output() -> (ManualOutput, OutputMonitor) {
    let log = Arc::new(Mutex::new(OutputLog::default()));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ManualOutput {
            log: log.clone(),
            ended: Some(rx),
        },
        OutputMonitor { log, ended: tx },
    )
}

impl AudioOutput for ManualOutput {
    fn current_time(&self) -> f64 {
        self.log.lock().unwrap().now
    }

    fn start_source(&mut self, id: SourceId, buffer: PcmBuffer, start_at: f64) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .started
            .push((id, start_at, buffer.samples.len()));
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        self.log.lock().unwrap().stopped.push(id);
    }

    fn take_completions(&mut self) -> Option<mpsc::UnboundedReceiver<SourceId>> {
        self.ended.take()
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub controller: SessionController,
    pub devices: Arc<FakeDevices>,
    pub connector: Arc<ScriptedConnector>,
    pub peers: mpsc::UnboundedReceiver<TransportPeer>,
    pub store: Arc<MemoryMessageStore>,
    pub output: OutputMonitor,
    pub updates: broadcast::Receiver<SessionUpdate>,
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        session_id: SESSION_ID.to_string(),
        ..SessionConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config(), StaticCredential::new(TOKEN))
    }

    pub fn with_config(config: SessionConfig, credentials: StaticCredential) -> Self {
        let devices = Arc::new(FakeDevices::default());
        let (connector, peers) = ScriptedConnector::new();
        let store = Arc::new(MemoryMessageStore::new());
        let (output, monitor) = manual_output();

        let controller = SessionController::spawn(
            config,
            SessionDeps {
                devices: devices.clone(),
                connector: connector.clone(),
                credentials: Arc::new(credentials),
                store: store.clone(),
                output: Box::new(output),
            },
        );
        let updates = controller.subscribe();

        Self {
            controller,
            devices,
            connector,
            peers,
            store,
            output: monitor,
            updates,
        }
    }

    /// Next connection attempt's peer
    pub async fn next_peer(&mut self) -> TransportPeer {
        self.peers.recv().await.expect("connector dropped")
    }

    /// Start and open the first transport; returns its peer
    pub async fn start_active(&mut self) -> TransportPeer {
        self.controller.start().await.unwrap();
        let peer = self.next_peer().await;
        peer.emit(TransportEvent::Opened).await;
        self.wait_status(SessionStatus::Active).await;
        peer
    }

    /// Consume updates until `pred` matches one
    pub async fn next_update(&mut self, pred: impl Fn(&SessionUpdate) -> bool) -> SessionUpdate {
        loop {
            match self.updates.recv().await {
                Ok(update) if pred(&update) => return update,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("update stream closed: {}", e),
            }
        }
    }

    pub async fn wait_status(&mut self, status: SessionStatus) -> SessionUpdate {
        self.next_update(|u| matches!(u, SessionUpdate::Status { status: s, .. } if *s == status))
            .await
    }
}
