//! Turn-level transcript aggregation
//!
//! Input and output transcription fragments are accumulated per role until
//! the endpoint completes the turn. A safety timer, armed by the first
//! fragment, finalizes a turn the endpoint never completes. Whichever of the
//! two happens first wins; the turn is taken out of the aggregator, so it can
//! only be finalized once.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::persistence::{ChatMessage, Role};

/// Appended to a turn finalized by the safety timer
pub const TIMEOUT_WARNING: &str =
    "\n\n[Response may be incomplete: the turn timed out before it finished.]";

pub type TurnId = u64;

/// Why a turn was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    Completed,
    TimedOut,
    Stopped,
}

/// Fragments collected for the turn in progress
#[derive(Debug, Clone)]
pub struct TranscriptTurn {
    pub id: TurnId,
    pub user: Vec<String>,
    pub assistant: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl TranscriptTurn {
    fn fragments(&self, role: Role) -> &[String] {
        match role {
            Role::User => &self.user,
            Role::Assistant => &self.assistant,
        }
    }

    /// Concatenation of every fragment for `role`
    pub fn text(&self, role: Role) -> String {
        self.fragments(role).concat()
    }
}

/// Result of finalizing a turn
#[derive(Debug, Clone)]
pub struct FinalizedTurn {
    pub turn_id: TurnId,
    pub reason: FinalizeReason,
    /// User message first, then assistant; empty roles are omitted
    pub messages: Vec<ChatMessage>,
}

pub struct TranscriptAggregator {
    timeout: Duration,
    current: Option<TranscriptTurn>,
    next_id: TurnId,
    timer: Option<JoinHandle<()>>,
    timeouts: mpsc::UnboundedSender<TurnId>,
}

impl TranscriptAggregator {
    /// Timer expirations are delivered on `timeouts` as the id of the turn
    /// they belong to; pass them back to `on_timeout`.
    pub fn new(timeout: Duration, timeouts: mpsc::UnboundedSender<TurnId>) -> Self {
        Self {
            timeout,
            current: None,
            next_id: 1,
            timer: None,
            timeouts,
        }
    }

    /// Add a fragment, opening a turn and arming the timer if none is open.
    ///
    /// Returns the id of the turn the fragment joined.
    pub fn push_fragment(&mut self, role: Role, text: &str) -> TurnId {
        let opened = self.current.is_none();
        let turn = self.current.get_or_insert_with(|| {
            let id = self.next_id;
            self.next_id += 1;
            TranscriptTurn {
                id,
                user: Vec::new(),
                assistant: Vec::new(),
                started_at: Utc::now(),
            }
        });

        match role {
            Role::User => turn.user.push(text.to_string()),
            Role::Assistant => turn.assistant.push(text.to_string()),
        }
        let id = turn.id;

        if opened {
            debug!("Opened transcript turn {}", id);
            self.arm_timer(id);
        }
        id
    }

    fn arm_timer(&mut self, id: TurnId) {
        self.disarm_timer();

        let timeout = self.timeout;
        let tx = self.timeouts.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(id);
        }));
    }

    fn disarm_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Finalize the open turn, if any
    pub fn finalize(&mut self, reason: FinalizeReason) -> Option<FinalizedTurn> {
        let turn = self.current.take()?;
        self.disarm_timer();

        let mut user = turn.text(Role::User).trim().to_string();
        let mut assistant = turn.text(Role::Assistant).trim().to_string();

        if reason == FinalizeReason::TimedOut {
            warn!("Transcript turn {} timed out before completion", turn.id);
            if !assistant.is_empty() {
                assistant.push_str(TIMEOUT_WARNING);
            } else if !user.is_empty() {
                user.push_str(TIMEOUT_WARNING);
            }
        }

        let mut messages = Vec::with_capacity(2);
        if !user.is_empty() {
            messages.push(ChatMessage::new(Role::User, user));
        }
        if !assistant.is_empty() {
            messages.push(ChatMessage::new(Role::Assistant, assistant));
        }

        debug!(
            "Finalized turn {} ({:?}) with {} messages",
            turn.id,
            reason,
            messages.len()
        );

        Some(FinalizedTurn {
            turn_id: turn.id,
            reason,
            messages,
        })
    }

    /// The safety timer for `turn_id` fired.
    ///
    /// Ignored if that turn was already finalized.
    pub fn on_timeout(&mut self, turn_id: TurnId) -> Option<FinalizedTurn> {
        match &self.current {
            Some(turn) if turn.id == turn_id => self.finalize(FinalizeReason::TimedOut),
            _ => {
                debug!("Ignoring timeout for finalized turn {}", turn_id);
                None
            }
        }
    }

    /// Accumulated text of the open turn for `role`
    pub fn text(&self, role: Role) -> String {
        self.current
            .as_ref()
            .map(|turn| turn.text(role))
            .unwrap_or_default()
    }

    pub fn timer_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for TranscriptAggregator {
    fn drop(&mut self) {
        self.disarm_timer();
    }
}
