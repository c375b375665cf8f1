use anyhow::{Context, Result};
use async_nats::Client;
use serde::Serialize;
use tracing::{debug, info};

use super::{ChatMessage, MessageStore};

/// Payload published for every finalized message
#[derive(Debug, Serialize)]
pub struct PersistedMessage<'a> {
    pub session_id: &'a str,
    #[serde(flatten)]
    pub message: &'a ChatMessage,
}

/// Publishes finalized messages to NATS for the chat history service
pub struct NatsMessageStore {
    client: Client,
    subject_prefix: String,
}

impl NatsMessageStore {
    /// Connect to NATS server
    pub async fn connect(url: &str, subject_prefix: impl Into<String>) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self {
            client,
            subject_prefix: subject_prefix.into(),
        })
    }

    /// Subject a session's messages are published on
    pub fn subject(&self, session_id: &str) -> String {
        message_subject(&self.subject_prefix, session_id)
    }
}

pub fn message_subject(prefix: &str, session_id: &str) -> String {
    format!("{}.{}", prefix.trim_end_matches('.'), session_id)
}

#[async_trait::async_trait]
impl MessageStore for NatsMessageStore {
    async fn save_message(&self, message: &ChatMessage, session_id: &str) -> Result<()> {
        let subject = self.subject(session_id);
        let payload = serde_json::to_vec(&PersistedMessage {
            session_id,
            message,
        })?;

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .context("Failed to publish message")?;

        debug!("Published {:?} message {} to {}", message.role, message.id, subject);

        Ok(())
    }
}
