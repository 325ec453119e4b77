//! Command dispatch for the `ragforge` binary
//!
//! Each input line is one JSON [`Command`]; each reply is one JSON
//! [`Reply`]. Commands run concurrently, replies are written in input order. Chat turns combine the session store and the engine: the user
//! message is recorded, the recent transcript is forwarded as history and the
//! answer is appended with its sources.

use crate::engine::{QueryRequest, RagEngine};
use crate::generator::Role;
use crate::session::{SessionMessage, SessionStore};
use ragforge_common::errors::{AppError, ErrorDetails, Result};
use ragforge_common::models::{Document, Metadata};
use ragforge_ingestion::Ingestor;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Commands accepted before the oldest reply is written
const MAX_IN_FLIGHT: usize = 64;

fn default_partition() -> String {
    "default".to_string()
}

/// One request line
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Query(QueryRequest),
    Ingest {
        documents: Vec<Document>,
        #[serde(default = "default_partition")]
        partition_key: String,
    },
    DeleteDocument {
        document_id: String,
        #[serde(default = "default_partition")]
        partition_key: String,
    },
    DeletePartition {
        partition_key: String,
    },
    CreateChat {
        user_id: String,
        #[serde(default = "default_partition")]
        partition_key: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        system_prompt: Option<String>,
    },
    Chat {
        chat_id: String,
        user_id: String,
        message: String,
    },
    History {
        chat_id: String,
        user_id: String,
        #[serde(default)]
        limit: Option<usize>,
    },
    ListChats {
        user_id: String,
        #[serde(default)]
        partition_key: Option<String>,
    },
    EndChat {
        chat_id: String,
        user_id: String,
    },
    Status,
}

/// One reply line
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

impl Reply {
    fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self {
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(e) => Self {
                ok: false,
                result: None,
                error: Some(ErrorDetails::from(&e)),
            },
        }
    }
}

/// Wires the engine, ingestion and sessions behind [`Command`]s
pub struct Service {
    engine: Arc<RagEngine>,
    ingestor: Arc<Ingestor>,
    sessions: Arc<SessionStore>,
    default_system_prompt: String,
}

impl Service {
    pub fn new(engine: Arc<RagEngine>, ingestor: Arc<Ingestor>, sessions: Arc<SessionStore>) -> Self {
        Self {
            engine,
            ingestor,
            sessions,
            default_system_prompt: crate::engine::DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    /// Parse and run one input line
    pub async fn handle_line(&self, line: &str) -> Reply {
        let command = serde_json::from_str::<Command>(line).map_err(|e| AppError::InvalidFormat {
            message: e.to_string(),
        });
        match command {
            Ok(command) => self.handle(command).await,
            Err(e) => Reply::from_result(Err(e)),
        }
    }

    pub async fn handle(&self, command: Command) -> Reply {
        Reply::from_result(self.dispatch(command).await)
    }

    /// Answer JSON-lines from `input` on `output` until end of input
    pub async fn serve<R, W>(self: Arc<Self>, input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::channel::<JoinHandle<Reply>>(MAX_IN_FLIGHT);

        let read = async move {
            let mut lines = input.lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let service = Arc::clone(&self);
                let task = tokio::spawn(async move { service.handle_line(&line).await });
                if tx.send(task).await.is_err() {
                    break;
                }
            }
            Ok::<(), AppError>(())
        };

        let write = async move {
            while let Some(task) = rx.recv().await {
                let reply = match task.await {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!(error = %e, "Command task failed");
                        Reply::from_result(Err(AppError::Internal {
                            message: format!("command task failed: {}", e),
                        }))
                    }
                };
                let mut encoded = serde_json::to_vec(&reply)?;
                encoded.push(b'\n');
                output.write_all(&encoded).await?;
                output.flush().await?;
            }
            Ok::<(), AppError>(())
        };

        let (read, write) = tokio::join!(read, write);
        read.and(write)
    }

    async fn dispatch(&self, command: Command) -> Result<Value> {
        match command {
            Command::Query(request) => Ok(serde_json::to_value(self.engine.process_query(request).await?)?),
            Command::Ingest {
                documents,
                partition_key,
            } => {
                let reports = self.ingestor.ingest_batch(documents, &partition_key).await?;
                Ok(serde_json::to_value(reports)?)
            }
            Command::DeleteDocument {
                document_id,
                partition_key,
            } => {
                let deleted = self.ingestor.delete_parent(&document_id, &partition_key).await?;
                Ok(json!({ "deleted": deleted }))
            }
            Command::DeletePartition { partition_key } => {
                let deleted = self.ingestor.delete_partition(&partition_key).await?;
                Ok(json!({ "deleted": deleted }))
            }
            Command::CreateChat {
                user_id,
                partition_key,
                title,
                system_prompt,
            } => {
                let chat = self
                    .sessions
                    .create_chat(
                        &user_id,
                        &partition_key,
                        title.as_deref(),
                        system_prompt.as_deref().unwrap_or(&self.default_system_prompt),
                    )
                    .await?;
                Ok(serde_json::to_value(chat)?)
            }
            Command::Chat {
                chat_id,
                user_id,
                message,
            } => self.chat(&chat_id, &user_id, message).await,
            Command::History { chat_id, user_id, limit } => {
                let messages = self.sessions.history(&chat_id, &user_id, limit).await?;
                Ok(serde_json::to_value(messages)?)
            }
            Command::ListChats { user_id, partition_key } => {
                let chats = self.sessions.list_chats(&user_id, partition_key.as_deref()).await?;
                Ok(serde_json::to_value(chats)?)
            }
            Command::EndChat { chat_id, user_id } => {
                let chat = self.sessions.end_chat(&chat_id, &user_id).await?;
                Ok(serde_json::to_value(chat)?)
            }
            Command::Status => {
                let store = self.engine.store();
                Ok(json!({
                    "version": ragforge_common::VERSION,
                    "store_degraded": store.is_degraded(),
                    "pending_transactions": store.pending_count().await,
                }))
            }
        }
    }

    /// One chat turn
    async fn chat(&self, chat_id: &str, user_id: &str, message: String) -> Result<Value> {
        let chat = self.sessions.get_chat(chat_id, user_id).await?;
        let transcript = self.sessions.history(chat_id, user_id, None).await?;

        let system_prompt = transcript
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone());
        let history = transcript.iter().map(SessionMessage::to_chat_message).collect();

        self.sessions
            .append_message(chat_id, user_id, SessionMessage::new(Role::User, message.clone()))
            .await?;

        let mut request = QueryRequest::new(message)
            .with_partition(chat.partition_key)
            .with_history(history);
        request.system_prompt = system_prompt;
        let response = self.engine.process_query(request).await?;

        let mut metadata = Metadata::new();
        metadata.insert("sources".to_string(), serde_json::to_value(&response.sources_used)?);
        metadata.insert("rag_enhanced".to_string(), json!(response.rag_enhanced));
        let answer = SessionMessage::new(Role::Assistant, response.response.clone()).with_metadata(metadata);
        self.sessions.append_message(chat_id, user_id, answer).await?;

        debug!(chat_id, "Chat turn complete");
        Ok(serde_json::to_value(response)?)
    }
}
