//! Conversation memory
//!
//! Append-only chat history scoped to a conversation id. Backed by the
//! `chat_conversations` / `chat_messages` tables when a database is
//! configured, otherwise by an in-process map.

pub mod store;

pub use store::{summarize, ChatMessage, ContentType, NewMessage, SenderType, NO_PREVIOUS_MESSAGES};

use crate::error::OrchestrationError;
use chrono::Utc;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

enum MemoryBackend {
    InMemory {
        conversations: Arc<RwLock<HashMap<i64, Vec<ChatMessage>>>>,
        next_id: AtomicI64,
    },
    Postgres {
        pool: PgPool,
        schema_ready: Arc<OnceCell<()>>,
    },
}

pub struct ConversationMemory {
    backend: MemoryBackend,
}

impl ConversationMemory {
    pub fn in_memory() -> Self {
        info!("Conversation memory backend: in-memory");
        Self {
            backend: MemoryBackend::InMemory {
                conversations: Arc::new(RwLock::new(HashMap::new())),
                next_id: AtomicI64::new(1),
            },
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        info!("Conversation memory backend: postgres");
        Self {
            backend: MemoryBackend::Postgres {
                pool,
                schema_ready: Arc::new(OnceCell::new()),
            },
        }
    }

    async fn ensure_schema_if_needed(&self) -> crate::Result<()> {
        let MemoryBackend::Postgres { pool, schema_ready } = &self.backend else {
            return Ok(());
        };

        schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS chat_conversations (
                      conversation_id BIGSERIAL PRIMARY KEY,
                      user_id BIGINT NOT NULL,
                      title TEXT NOT NULL DEFAULT '',
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS chat_messages (
                      message_id BIGSERIAL PRIMARY KEY,
                      conversation_id BIGINT NOT NULL REFERENCES chat_conversations (conversation_id),
                      sender_type TEXT NOT NULL,
                      source_agent TEXT,
                      content TEXT NOT NULL,
                      content_type TEXT NOT NULL DEFAULT 'text',
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_chat_messages_conversation_time
                    ON chat_messages (conversation_id, created_at);
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!(
                    "Failed to initialize conversation memory schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    /// Reuse `conversation_id` when given, otherwise open a new conversation.
    pub async fn start_conversation(
        &self,
        user_id: i64,
        conversation_id: Option<i64>,
        title: &str,
    ) -> crate::Result<i64> {
        if let Some(id) = conversation_id {
            return Ok(id);
        }

        let title: String = title.chars().take(80).collect();

        match &self.backend {
            MemoryBackend::InMemory {
                conversations,
                next_id,
            } => {
                let id = next_id.fetch_add(1, Ordering::SeqCst);
                conversations.write().await.insert(id, Vec::new());
                debug!(conversation_id = id, user_id, "Conversation created");
                Ok(id)
            }
            MemoryBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;

                let row = sqlx::query(
                    "INSERT INTO chat_conversations (user_id, title) VALUES ($1, $2) RETURNING conversation_id",
                )
                .bind(user_id)
                .bind(&title)
                .fetch_one(pool)
                .await
                .map_err(|e| {
                    OrchestrationError::DatabaseError(format!("Failed to create conversation: {}", e))
                })?;

                let id: i64 = row.try_get("conversation_id")?;
                debug!(conversation_id = id, user_id, "Conversation created");
                Ok(id)
            }
        }
    }

    pub async fn append_message(&self, conversation_id: i64, message: NewMessage) -> crate::Result<()> {
        match &self.backend {
            MemoryBackend::InMemory {
                conversations,
                next_id,
            } => {
                let stored = ChatMessage {
                    message_id: next_id.fetch_add(1, Ordering::SeqCst),
                    conversation_id,
                    sender_type: message.sender_type,
                    source_agent: message.source_agent,
                    content: message.content,
                    content_type: message.content_type,
                    created_at: Utc::now(),
                };
                conversations
                    .write()
                    .await
                    .entry(conversation_id)
                    .or_default()
                    .push(stored);
                Ok(())
            }
            MemoryBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;

                sqlx::query(
                    r#"
                    INSERT INTO chat_messages
                      (conversation_id, sender_type, source_agent, content, content_type)
                    VALUES
                      ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(conversation_id)
                .bind(message.sender_type.as_str())
                .bind(&message.source_agent)
                .bind(&message.content)
                .bind(message.content_type.as_str())
                .execute(pool)
                .await
                .map_err(|e| {
                    OrchestrationError::DatabaseError(format!("Failed to append chat message: {}", e))
                })?;
                Ok(())
            }
        }
    }

    /// The `limit` most recent messages, oldest first.
    pub async fn read_recent(&self, conversation_id: i64, limit: usize) -> crate::Result<Vec<ChatMessage>> {
        match &self.backend {
            MemoryBackend::InMemory { conversations, .. } => {
                let locked = conversations.read().await;
                let messages = locked.get(&conversation_id).map(Vec::as_slice).unwrap_or(&[]);
                let start = messages.len().saturating_sub(limit);
                Ok(messages[start..].to_vec())
            }
            MemoryBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;

                let rows = sqlx::query(
                    r#"
                    SELECT message_id, conversation_id, sender_type, source_agent, content, content_type, created_at
                    FROM chat_messages
                    WHERE conversation_id = $1
                    ORDER BY created_at DESC, message_id DESC
                    LIMIT $2
                    "#,
                )
                .bind(conversation_id)
                .bind(limit as i64)
                .fetch_all(pool)
                .await
                .map_err(|e| {
                    OrchestrationError::DatabaseError(format!("Failed to load chat messages: {}", e))
                })?;

                let mut messages: Vec<ChatMessage> = rows
                    .iter()
                    .map(|row| {
                        let sender: String = row.try_get("sender_type").unwrap_or_default();
                        let content_type: String = row.try_get("content_type").unwrap_or_default();
                        ChatMessage {
                            message_id: row.try_get("message_id").unwrap_or_default(),
                            conversation_id,
                            sender_type: SenderType::from_db(&sender),
                            source_agent: row.try_get("source_agent").ok().flatten(),
                            content: row.try_get("content").unwrap_or_default(),
                            content_type: ContentType::from_db(&content_type),
                            created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
                        }
                    })
                    .collect();

                messages.reverse();
                Ok(messages)
            }
        }
    }

    /// Text transcript of the recent window.
    pub async fn summary(&self, conversation_id: i64, limit: usize) -> crate::Result<String> {
        let messages = self.read_recent(conversation_id, limit).await?;
        Ok(summarize(&messages))
    }

    /// Most recent JSON payload written by `source_agent`.
    pub async fn latest_payload(
        &self,
        conversation_id: i64,
        source_agent: &str,
        limit: usize,
    ) -> crate::Result<Option<Value>> {
        let messages = self.read_recent(conversation_id, limit).await?;
        Ok(messages
            .iter()
            .rev()
            .filter(|m| m.is_from(source_agent))
            .find_map(ChatMessage::payload))
    }
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::in_memory()
    }
}
