// Integration tests for the live session controller
//
// These tests drive a controller through fake devices, a scripted transport,
// and a manual-clock audio output, with tokio's clock paused so backoff
// delays and the transcript safety timer are deterministic.

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use live_session::session::TIMEOUT_WARNING;
use live_session::transport::{TransportEvent, INPUT_AUDIO_MIME, IMAGE_MIME};
use live_session::{
    ChatMessage, DeviceKind, FinalizeReason, MediaTrack, MessageStore, Role, SampleBlock,
    SessionConfig, SessionController, SessionDeps, SessionError, SessionStatus, SessionUpdate,
    StaticCredential,
};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_happy_path_streams_media_and_persists_turn() {
    let mut h = Harness::new();

    h.controller.start().await.unwrap();
    h.wait_status(SessionStatus::RequestingPermissions).await;
    h.wait_status(SessionStatus::Connecting).await;

    let mut peer = h.next_peer().await;
    assert_eq!(h.connector.tokens.lock().unwrap().as_slice(), [TOKEN]);

    peer.emit(TransportEvent::Opened).await;
    h.wait_status(SessionStatus::Active).await;

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Active);
    assert!(snapshot.devices.contains(&DeviceKind::Video));
    assert!(snapshot.devices.contains(&DeviceKind::Microphone));

    // One full 4096-sample frame at 16kHz mono
    let mic = h.devices.latest_audio().unwrap();
    mic.feed(SampleBlock {
        samples: vec![0.25; 4096],
        sample_rate: 16000,
        channels: 1,
    });

    let mut seen = HashSet::new();
    while seen.len() < 2 {
        let message = peer.outbound.recv().await.unwrap();
        seen.insert(message.mime_type().to_string());
    }
    assert!(seen.contains(INPUT_AUDIO_MIME));
    assert!(seen.contains(IMAGE_MIME));

    peer.emit(output_text("Hel")).await;
    peer.emit(output_text("lo ")).await;
    peer.emit(output_text("there")).await;
    peer.emit(turn_complete()).await;

    let finalized = h
        .next_update(|u| matches!(u, SessionUpdate::TurnFinalized { .. }))
        .await;
    let SessionUpdate::TurnFinalized { reason, messages } = finalized else {
        unreachable!()
    };
    assert_eq!(reason, FinalizeReason::Completed);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "Hello there");

    h.controller.stop().await.unwrap();
    assert_eq!(h.controller.status(), SessionStatus::Idle);

    let saved = h.store.messages(SESSION_ID).await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].role, Role::Assistant);
    assert_eq!(saved[0].content, "Hello there");
}

#[tokio::test(start_paused = true)]
async fn test_user_turn_persists_once_and_clears_timer() {
    let mut h = Harness::new();
    let peer = h.start_active().await;

    peer.emit(input_text("Hel")).await;
    peer.emit(input_text("lo ")).await;
    peer.emit(input_text("there")).await;
    peer.emit(turn_complete()).await;

    let finalized = h
        .next_update(|u| matches!(u, SessionUpdate::TurnFinalized { .. }))
        .await;
    let SessionUpdate::TurnFinalized { reason, messages } = finalized else {
        unreachable!()
    };
    assert_eq!(reason, FinalizeReason::Completed);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "Hello there");

    // Past the 12s safety timeout: the timer went with the turn
    tokio::time::sleep(Duration::from_secs(13)).await;
    while let Ok(update) = h.updates.try_recv() {
        assert!(
            !matches!(
                update,
                SessionUpdate::TurnFinalized { .. } | SessionUpdate::Warning { .. }
            ),
            "unexpected {:?}",
            update
        );
    }

    h.controller.stop().await.unwrap();
    let saved = h.store.messages(SESSION_ID).await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].role, Role::User);
    assert_eq!(saved[0].content, "Hello there");
}

#[tokio::test(start_paused = true)]
async fn test_streaming_transcript_updates_accumulate() {
    let mut h = Harness::new();
    let peer = h.start_active().await;

    peer.emit(input_text("What's ")).await;
    peer.emit(input_text("this?")).await;

    let mut last = None;
    for _ in 0..2 {
        last = Some(
            h.next_update(|u| matches!(u, SessionUpdate::Transcript { .. }))
                .await,
        );
    }
    let Some(SessionUpdate::Transcript {
        role,
        text,
        streaming,
    }) = last
    else {
        unreachable!()
    };
    assert_eq!(role, Role::User);
    assert_eq!(text, "What's this?");
    assert!(streaming);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_close_reconnects_with_backoff() {
    let mut h = Harness::new();
    let first = h.start_active().await;

    first
        .emit(TransportEvent::Closed(Some("network lost".into())))
        .await;

    let update = h
        .next_update(|u| matches!(u, SessionUpdate::Reconnecting { .. }))
        .await;
    let SessionUpdate::Reconnecting { attempt, delay_ms } = update else {
        unreachable!()
    };
    assert_eq!(attempt, 1);
    assert!((250..=500).contains(&delay_ms), "delay {}ms", delay_ms);
    assert_eq!(h.controller.status(), SessionStatus::Reconnecting);
    assert_eq!(h.controller.snapshot().reconnect_attempt, 1);

    let scheduled_at = Instant::now();
    let second = h.next_peer().await;
    let waited = scheduled_at.elapsed();
    assert!(waited >= Duration::from_millis(250), "{:?}", waited);
    assert!(waited <= Duration::from_millis(500), "{:?}", waited);
    h.wait_status(SessionStatus::Connecting).await;

    // Events from the closed transport are ignored
    first.emit(output_text("ghost")).await;

    second.emit(TransportEvent::Opened).await;
    h.wait_status(SessionStatus::Active).await;
    second.emit(output_text("real")).await;

    let update = h
        .next_update(|u| matches!(u, SessionUpdate::Transcript { .. }))
        .await;
    let SessionUpdate::Transcript { text, .. } = update else {
        unreachable!()
    };
    assert_eq!(text, "real");

    // The running microphone pipeline was kept, not attached a second time
    assert_eq!(h.devices.latest_audio().unwrap().reader_count(), 1);

    assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(h.controller.snapshot().reconnect_attempt, 0);
    // Live devices are reused across the reconnect
    assert_eq!(h.devices.video_requests.load(Ordering::SeqCst), 1);
    assert_eq!(h.devices.audio_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mic_frames_dropped_while_reconnecting() {
    let mut h = Harness::new();
    let first = h.start_active().await;

    first.emit(TransportEvent::Closed(None)).await;
    h.wait_status(SessionStatus::Reconnecting).await;

    // Two full frames captured with no transport open
    let mic = h.devices.latest_audio().unwrap();
    mic.feed(SampleBlock {
        samples: vec![0.25; 4096 * 2],
        sample_rate: 16000,
        channels: 1,
    });

    let mut second = h.next_peer().await;
    second.emit(TransportEvent::Opened).await;
    h.wait_status(SessionStatus::Active).await;

    assert_eq!(h.controller.snapshot().audio_frames_dropped, 2);
    assert_eq!(h.controller.snapshot().audio_frames_sent, 0);

    // Nothing captured while disconnected reaches the new transport
    while let Ok(message) = second.outbound.try_recv() {
        assert_ne!(message.mime_type(), INPUT_AUDIO_MIME);
    }
}

#[tokio::test(start_paused = true)]
async fn test_error_then_close_schedules_single_reconnect() {
    let mut h = Harness::new();
    let peer = h.start_active().await;

    peer.emit(TransportEvent::Error("socket reset".into())).await;
    peer.emit(TransportEvent::Closed(None)).await;

    h.next_update(|u| matches!(u, SessionUpdate::Reconnecting { .. }))
        .await;
    let _second = h.next_peer().await;

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(h.peers.try_recv().is_err());
    assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_max_attempts() {
    let config = SessionConfig {
        reconnect_max_attempts: 2,
        ..test_config()
    };
    let mut h = Harness::with_config(config, StaticCredential::new(TOKEN));
    let first = h.start_active().await;

    first.emit(TransportEvent::Closed(None)).await;
    let update = h
        .next_update(|u| matches!(u, SessionUpdate::Reconnecting { .. }))
        .await;
    assert!(matches!(update, SessionUpdate::Reconnecting { attempt: 1, .. }));

    let second = h.next_peer().await;
    second.emit(TransportEvent::Error("refused".into())).await;

    let update = h
        .next_update(|u| matches!(u, SessionUpdate::Reconnecting { .. }))
        .await;
    assert!(matches!(update, SessionUpdate::Reconnecting { attempt: 2, .. }));

    let third = h.next_peer().await;
    third.emit(TransportEvent::Error("refused".into())).await;

    let update = h.wait_status(SessionStatus::Error).await;
    let SessionUpdate::Status { error, .. } = update else {
        unreachable!()
    };
    assert!(matches!(error, Some(SessionError::Transport(_))));
    assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 3);

    // Devices stay held for the retry affordance
    assert_eq!(h.controller.snapshot().devices.len(), 2);

    h.controller.retry().await.unwrap();
    let fourth = h.next_peer().await;
    fourth.emit(TransportEvent::Opened).await;
    h.wait_status(SessionStatus::Active).await;
}

#[tokio::test(start_paused = true)]
async fn test_denied_camera_keeps_microphone_for_retry() {
    let mut h = Harness::new();
    h.devices.deny_video.store(true, Ordering::SeqCst);

    let err = h.controller.start().await.unwrap_err();
    assert_eq!(
        err,
        SessionError::PermissionDenied {
            device: DeviceKind::Video
        }
    );
    assert!(err.to_string().contains("camera/screen"));

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Error);
    assert_eq!(snapshot.devices, vec![DeviceKind::Microphone]);
    assert!(h.peers.try_recv().is_err());

    h.devices.deny_video.store(false, Ordering::SeqCst);
    h.controller.retry().await.unwrap();

    let peer = h.next_peer().await;
    peer.emit(TransportEvent::Opened).await;
    h.wait_status(SessionStatus::Active).await;

    assert_eq!(h.devices.video_requests.load(Ordering::SeqCst), 2);
    assert_eq!(h.devices.audio_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_denied_microphone_keeps_camera_for_retry() {
    let mut h = Harness::new();
    h.devices.deny_audio.store(true, Ordering::SeqCst);

    let err = h.controller.start().await.unwrap_err();
    assert!(err.to_string().starts_with("microphone access was denied"));

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Error);
    assert_eq!(snapshot.last_error, Some(err));
    assert_eq!(snapshot.devices, vec![DeviceKind::Video]);
    assert!(h.devices.latest_video().unwrap().is_live());

    h.devices.deny_audio.store(false, Ordering::SeqCst);
    h.controller.retry().await.unwrap();
    let _peer = h.next_peer().await;

    assert_eq!(h.devices.video_requests.load(Ordering::SeqCst), 1);
    assert_eq!(h.devices.audio_requests.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_both_denied_reports_camera() {
    let h = Harness::new();
    h.devices.deny_video.store(true, Ordering::SeqCst);
    h.devices.deny_audio.store(true, Ordering::SeqCst);

    let err = h.controller.start().await.unwrap_err();
    assert_eq!(
        err,
        SessionError::PermissionDenied {
            device: DeviceKind::Video
        }
    );
    assert_eq!(h.devices.audio_requests.load(Ordering::SeqCst), 1);
    assert!(h.controller.snapshot().devices.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_credential_is_unauthorized() {
    let mut h = Harness::with_config(test_config(), StaticCredential::new(""));

    let err = h.controller.start().await.unwrap_err();
    assert!(matches!(err, SessionError::Unauthorized(_)));
    assert!(err.is_permission());
    assert_eq!(h.controller.status(), SessionStatus::Error);
    assert!(h.peers.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_flushes_playback() {
    let mut h = Harness::new();
    let peer = h.start_active().await;

    // Three 0.5s chunks at 24kHz
    for _ in 0..3 {
        peer.emit(audio_chunk(12000)).await;
    }
    let update = h
        .next_update(|u| matches!(u, SessionUpdate::Speaking { .. }))
        .await;
    assert!(matches!(update, SessionUpdate::Speaking { speaking: true }));

    h.output.set_now(0.2);
    peer.emit(interrupted()).await;
    let update = h
        .next_update(|u| matches!(u, SessionUpdate::Speaking { .. }))
        .await;
    assert!(matches!(update, SessionUpdate::Speaking { speaking: false }));

    let started = h.output.started();
    let starts: Vec<f64> = started.iter().map(|(_, at, _)| *at).collect();
    assert_eq!(starts, vec![0.0, 0.5, 1.0]);

    let mut stopped = h.output.stopped();
    stopped.sort();
    let mut ids: Vec<u64> = started.iter().map(|(id, _, _)| *id).collect();
    ids.sort();
    assert_eq!(stopped, ids);
    assert!(!h.controller.snapshot().speaking);

    // The next chunk starts at the present, not at the old cursor
    peer.emit(audio_chunk(2400)).await;
    h.next_update(|u| matches!(u, SessionUpdate::Speaking { speaking: true }))
        .await;
    let started = h.output.started();
    assert_eq!(started.last().unwrap().1, 0.2);
}

#[tokio::test(start_paused = true)]
async fn test_speaking_clears_when_last_source_ends() {
    let mut h = Harness::new();
    let peer = h.start_active().await;

    peer.emit(audio_chunk(2400)).await;
    peer.emit(audio_chunk(2400)).await;
    h.next_update(|u| matches!(u, SessionUpdate::Speaking { speaking: true }))
        .await;

    // Wait for the second chunk to be scheduled as well
    peer.emit(output_text("ok")).await;
    h.next_update(|u| matches!(u, SessionUpdate::Transcript { .. }))
        .await;

    let ids: Vec<u64> = h.output.started().iter().map(|(id, _, _)| *id).collect();
    assert_eq!(ids.len(), 2);

    h.output.end(ids[0]);
    h.output.end(ids[1]);
    h.next_update(|u| matches!(u, SessionUpdate::Speaking { speaking: false }))
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_bad_audio_chunk_is_skipped() {
    let mut h = Harness::new();
    let peer = h.start_active().await;

    peer.emit(server_message(serde_json::json!({
        "serverContent": { "modelTurn": { "parts": [ { "inlineData": { "data": "%%%" } } ] } }
    })))
    .await;

    h.next_update(|u| matches!(u, SessionUpdate::Warning { .. }))
        .await;
    assert!(h.output.started().is_empty());
    assert_eq!(h.controller.status(), SessionStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_transcript_timeout_finalizes_once() {
    let mut h = Harness::new();
    let peer = h.start_active().await;

    let opened_at = Instant::now();
    peer.emit(input_text("Hello?")).await;

    let update = h
        .next_update(|u| matches!(u, SessionUpdate::TurnFinalized { .. }))
        .await;
    assert!(opened_at.elapsed() >= Duration::from_secs(12));

    let SessionUpdate::TurnFinalized { reason, messages } = update else {
        unreachable!()
    };
    assert_eq!(reason, FinalizeReason::TimedOut);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, format!("Hello?{}", TIMEOUT_WARNING));

    // A late completion does not finalize again
    peer.emit(turn_complete()).await;
    peer.emit(output_text("after")).await;
    let update = h
        .next_update(|u| {
            matches!(
                u,
                SessionUpdate::TurnFinalized { .. } | SessionUpdate::Transcript { .. }
            )
        })
        .await;
    assert!(matches!(update, SessionUpdate::Transcript { .. }));

    h.controller.stop().await.unwrap();
    let saved = h.store.messages(SESSION_ID).await;
    assert_eq!(saved.len(), 2);
    assert!(saved[0].content.ends_with(TIMEOUT_WARNING));
    assert_eq!(saved[1].content, "after");
}

#[tokio::test(start_paused = true)]
async fn test_stop_persists_pending_turn_without_warning() {
    let mut h = Harness::new();
    let peer = h.start_active().await;

    peer.emit(input_text("Describe the room")).await;
    peer.emit(output_text("I see a desk")).await;
    h.next_update(|u| matches!(u, SessionUpdate::Transcript { role: Role::Assistant, .. }))
        .await;

    h.controller.stop().await.unwrap();

    let saved = h.store.messages(SESSION_ID).await;
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[0].role, Role::User);
    assert_eq!(saved[0].content, "Describe the room");
    assert_eq!(saved[1].content, "I see a desk");
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_backoff_cancels_reconnect() {
    let mut h = Harness::new();
    let peer = h.start_active().await;

    peer.emit(TransportEvent::Closed(None)).await;
    h.wait_status(SessionStatus::Reconnecting).await;

    h.controller.stop().await.unwrap();
    assert_eq!(h.controller.status(), SessionStatus::Idle);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(h.peers.try_recv().is_err());
    assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 1);

    let snapshot = h.controller.snapshot();
    assert!(snapshot.devices.is_empty());
    assert!(!h.devices.latest_audio().unwrap().is_live());
    assert!(!h.devices.latest_video().unwrap().is_live());
}

#[tokio::test(start_paused = true)]
async fn test_close_after_stop_is_ignored() {
    let mut h = Harness::new();
    let peer = h.start_active().await;

    h.controller.stop().await.unwrap();
    peer.emit(TransportEvent::Closed(Some("bye".into()))).await;

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(h.peers.try_recv().is_err());
    assert_eq!(h.controller.status(), SessionStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_active_is_rejected() {
    let mut h = Harness::new();
    let _peer = h.start_active().await;

    assert_eq!(h.controller.start().await, Err(SessionError::AlreadyActive));
    assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_outside_error_is_invalid() {
    let h = Harness::new();

    let err = h.controller.retry().await.unwrap_err();
    assert_eq!(
        err,
        SessionError::InvalidState {
            operation: "retry",
            status: SessionStatus::Idle
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let mut h = Harness::new();
    h.controller.stop().await.unwrap();

    let _peer = h.start_active().await;
    h.controller.stop().await.unwrap();
    h.controller.stop().await.unwrap();
    assert_eq!(h.controller.status(), SessionStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop_acquires_fresh_devices() {
    let mut h = Harness::new();
    let _peer = h.start_active().await;
    h.controller.stop().await.unwrap();

    let _peer = h.start_active().await;
    assert_eq!(h.devices.video_requests.load(Ordering::SeqCst), 2);
    assert_eq!(h.devices.audio_requests.load(Ordering::SeqCst), 2);
    assert_eq!(h.devices.latest_audio().unwrap().reader_count(), 1);
}

struct FailingStore;

#[async_trait::async_trait]
impl MessageStore for FailingStore {
    async fn save_message(&self, _message: &ChatMessage, _session_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("database unavailable")
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_saves_are_reported_on_stop() {
    let (connector, mut peers) = ScriptedConnector::new();
    let (output, _monitor) = manual_output();
    let controller = SessionController::spawn(
        test_config(),
        SessionDeps {
            devices: Arc::new(FakeDevices::default()),
            connector,
            credentials: Arc::new(StaticCredential::new(TOKEN)),
            store: Arc::new(FailingStore),
            output: Box::new(output),
        },
    );
    let mut updates = controller.subscribe();

    controller.start().await.unwrap();
    let peer = peers.recv().await.unwrap();
    peer.emit(TransportEvent::Opened).await;
    peer.emit(output_text("lost")).await;
    peer.emit(turn_complete()).await;

    loop {
        if let SessionUpdate::TurnFinalized { .. } = updates.recv().await.unwrap() {
            break;
        }
    }

    controller.stop().await.unwrap();
    assert_eq!(controller.status(), SessionStatus::Idle);

    let warning = loop {
        if let SessionUpdate::Warning { message } = updates.recv().await.unwrap() {
            break message;
        }
    };
    assert!(warning.contains("1 messages could not be saved"), "{}", warning);
}
