//! Chat session persistence
//!
//! Sessions live in the shared cache store:
//! - `chat:<id>` holds the session JSON
//! - `chat:<id>:messages` is the transcript stream, in arrival order
//! - `user:<user>:chats:<partition>` is the set of a user's chat ids
//!
//! Multi-key writes go through one store transaction each.

use crate::generator::{ChatMessage, Role};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use ragforge_common::cache::{keys, CacheStore};
use ragforge_common::config::SessionConfig;
use ragforge_common::errors::{AppError, Result};
use ragforge_common::models::Metadata;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Chat session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub partition_key: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Transcript entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SessionMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

const DEFAULT_TITLE: &str = "New chat";

/// Session store on top of [`CacheStore`]
pub struct SessionStore {
    store: Arc<CacheStore>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(store: Arc<CacheStore>, config: &SessionConfig) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(config.ttl_secs),
        }
    }

    /// Create a chat seeded with its system message
    #[instrument(skip(self, system_prompt))]
    pub async fn create_chat(
        &self,
        user_id: &str,
        partition_key: &str,
        title: Option<&str>,
        system_prompt: &str,
    ) -> Result<ChatSession> {
        if user_id.trim().is_empty() {
            return Err(AppError::Validation {
                message: "user_id must not be empty".to_string(),
                field: Some("user_id".to_string()),
            });
        }

        let now = Utc::now();
        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            partition_key: partition_key.to_string(),
            title: title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_TITLE)
                .to_string(),
            created_at: now,
            updated_at: now,
            ended_at: None,
            is_active: true,
        };
        let system = SessionMessage::new(Role::System, system_prompt);

        let outcome = self
            .store
            .transaction()
            .set_json(&keys::chat_session(&session.id), &session, None)?
            .add_member(&keys::user_chats(user_id, partition_key), &session.id)
            .append(&keys::chat_messages(&session.id), serde_json::to_string(&system)?)
            .commit()
            .await;

        if !outcome.success {
            warn!(chat_id = %session.id, pending = outcome.pending, "Chat created locally only");
        }
        info!(chat_id = %session.id, "Chat created");
        Ok(session)
    }

    /// Load a session owned by `user_id`
    pub async fn get_chat(&self, chat_id: &str, user_id: &str) -> Result<ChatSession> {
        match self.store.get_json::<ChatSession>(&keys::chat_session(chat_id)).await? {
            Some(session) if session.user_id == user_id => Ok(session),
            _ => Err(AppError::SessionNotFound {
                id: chat_id.to_string(),
            }),
        }
    }

    /// Append a message to the transcript and touch the session
    pub async fn append_message(&self, chat_id: &str, user_id: &str, message: SessionMessage) -> Result<SessionMessage> {
        let mut session = self.get_chat(chat_id, user_id).await?;
        if !session.is_active {
            return Err(AppError::Validation {
                message: format!("chat {} has ended", chat_id),
                field: Some("chat_id".to_string()),
            });
        }
        session.updated_at = Utc::now();

        let outcome = self
            .store
            .transaction()
            .append(&keys::chat_messages(chat_id), serde_json::to_string(&message)?)
            .set_json(&keys::chat_session(chat_id), &session, None)?
            .commit()
            .await;

        if !outcome.success {
            warn!(chat_id, "Message stored locally only");
        }
        debug!(chat_id, role = ?message.role, "Message appended");
        Ok(message)
    }

    /// Transcript in arrival order, optionally only the last `limit` messages
    pub async fn history(&self, chat_id: &str, user_id: &str, limit: Option<usize>) -> Result<Vec<SessionMessage>> {
        self.get_chat(chat_id, user_id).await?;

        let messages: Vec<SessionMessage> = self
            .store
            .read_stream(&keys::chat_messages(chat_id))
            .await
            .iter()
            .filter_map(|payload| match serde_json::from_str(payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(chat_id, error = %e, "Skipping unreadable transcript entry");
                    None
                }
            })
            .collect();

        let skip = limit.map_or(0, |l| messages.len().saturating_sub(l));
        Ok(messages.into_iter().skip(skip).collect())
    }

    /// A user's chats, most recently updated first
    pub async fn list_chats(&self, user_id: &str, partition_key: Option<&str>) -> Result<Vec<ChatSession>> {
        let set_keys = match partition_key {
            Some(partition) => vec![keys::user_chats(user_id, partition)],
            None => self.store.scan(&keys::user_chats(user_id, "")).await,
        };

        let mut chat_ids = Vec::new();
        for key in &set_keys {
            chat_ids.extend(self.store.members(key).await);
        }

        let loaded = join_all(chat_ids.iter().map(|id| async move {
            let key = keys::chat_session(id);
            self.store.get_json::<ChatSession>(&key).await
        }))
        .await;

        let mut sessions = Vec::with_capacity(loaded.len());
        for result in loaded {
            if let Some(session) = result? {
                if session.user_id == user_id {
                    sessions.push(session);
                }
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Mark a chat as ended; its transcript stays readable
    pub async fn end_chat(&self, chat_id: &str, user_id: &str) -> Result<ChatSession> {
        let mut session = self.get_chat(chat_id, user_id).await?;
        if session.is_active {
            let now = Utc::now();
            session.is_active = false;
            session.ended_at = Some(now);
            session.updated_at = now;
            self.store.set_json(&keys::chat_session(chat_id), &session, None).await?;
            info!(chat_id, "Chat ended");
        }
        Ok(session)
    }

    /// Delete a session, its transcript and its membership in one transaction
    pub async fn remove_chat(&self, session: &ChatSession) -> bool {
        let outcome = self
            .store
            .transaction()
            .delete(&keys::chat_session(&session.id))
            .delete(&keys::chat_messages(&session.id))
            .remove_member(&keys::user_chats(&session.user_id, &session.partition_key), &session.id)
            .commit()
            .await;
        outcome.success
    }

    fn is_expired(&self, session: &ChatSession, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => session.updated_at + ttl < now,
            Err(_) => false,
        }
    }

    /// One cleanup sweep over `chat:` keys in batches of `batch_size`
    ///
    /// Returns the number of sessions removed.
    pub async fn cleanup_expired(&self, batch_size: usize) -> usize {
        let prefix = keys::chat_session("");
        let session_keys: Vec<String> = self
            .store
            .scan(&prefix)
            .await
            .into_iter()
            .filter(|key| key.strip_prefix(&prefix).is_some_and(|id| !id.is_empty() && !id.contains(':')))
            .collect();

        let now = Utc::now();
        let mut removed = 0;
        for batch in session_keys.chunks(batch_size.max(1)) {
            for key in batch {
                let session = match self.store.get_json::<ChatSession>(key).await {
                    Ok(Some(session)) => session,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Skipping unreadable session");
                        continue;
                    }
                };
                if self.is_expired(&session, now) {
                    if !self.remove_chat(&session).await {
                        warn!(chat_id = %session.id, "Expired session removed locally only");
                    }
                    removed += 1;
                }
            }
            tokio::task::yield_now().await;
        }

        if removed > 0 {
            info!(removed, scanned = session_keys.len(), "Expired sessions cleaned up");
        }
        removed
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `interval`
    ///
    /// The task has no cancellation signal; abort the handle to stop it.
    pub fn spawn_cleanup(self: Arc<Self>, interval: Duration, batch_size: usize) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.cleanup_expired(batch_size).await;
                debug!(removed, "Session cleanup sweep finished");
            }
        })
    }
}
