//! Durable storage for finalized transcript turns
//!
//! The live session only needs a single "save a message" operation; where the
//! message ends up is the store's business. Saves run on a dedicated worker
//! so the session loop never waits on storage, and failures are logged
//! without being retried.

pub mod nats;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub use nats::NatsMessageStore;

/// Speaker of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A finalized chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Persistence collaborator
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message(&self, message: &ChatMessage, session_id: &str) -> Result<()>;
}

/// Keeps messages in memory, grouped by session
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<(String, ChatMessage)>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages saved for `session_id`, in save order
    pub async fn messages(&self, session_id: &str) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save_message(&self, message: &ChatMessage, session_id: &str) -> Result<()> {
        self.messages
            .lock()
            .await
            .push((session_id.to_string(), message.clone()));
        Ok(())
    }
}

/// Only logs messages; used when no store is configured
#[derive(Debug, Default)]
pub struct LogMessageStore;

#[async_trait::async_trait]
impl MessageStore for LogMessageStore {
    async fn save_message(&self, message: &ChatMessage, session_id: &str) -> Result<()> {
        info!(
            "[{}] {:?}: {}",
            session_id, message.role, message.content
        );
        Ok(())
    }
}

enum Job {
    Save {
        message: ChatMessage,
        session_id: String,
    },
    Flush(oneshot::Sender<()>),
}

/// Saves messages one at a time, in the order they were queued
pub struct PersistenceWorker {
    tx: mpsc::UnboundedSender<Job>,
    failures: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl PersistenceWorker {
    pub fn spawn(store: Arc<dyn MessageStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let failures = Arc::new(AtomicU64::new(0));
        let failure_count = Arc::clone(&failures);

        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Save {
                        message,
                        session_id,
                    } => match store.save_message(&message, &session_id).await {
                        Ok(()) => debug!("Persisted {:?} message {}", message.role, message.id),
                        Err(e) => {
                            failure_count.fetch_add(1, Ordering::Relaxed);
                            error!(
                                "Failed to persist {:?} message {}: {:#}",
                                message.role, message.id, e
                            );
                        }
                    },
                    Job::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self {
            tx,
            failures,
            task,
        }
    }

    /// Queue a message for saving
    pub fn enqueue(&self, message: ChatMessage, session_id: &str) {
        let job = Job::Save {
            message,
            session_id: session_id.to_string(),
        };
        if self.tx.send(job).is_err() {
            error!("Persistence worker has stopped; message dropped");
        }
    }

    /// Wait until every message queued so far has been attempted
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Job::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Number of saves that failed
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
