//! End-to-end tests: ingestion, multi-hop retrieval, reranking, generation,
//! the query cache and chat sessions over a local-only store.

use async_trait::async_trait;
use ragforge_common::cache::{CacheStore, RemoteStore, StoreOp, StreamEntry};
use ragforge_common::config::{AppConfig, EmbeddingConfig, FallbackConfig, RedisConfig};
use ragforge_common::embeddings::{HashEmbedder, ResilientEmbedder};
use ragforge_common::errors::{AppError, Result};
use ragforge_common::index::{InMemoryVectorIndex, VectorIndex};
use ragforge_common::models::{Document, Filter};
use ragforge_context::engine::APOLOGY_RESPONSE;
use ragforge_context::{
    ChatMessage, Command, CompletionRequest, Generator, LexicalOverlapScorer, QueryRequest, RagEngine, Service,
    SessionStore,
};
use ragforge_ingestion::Ingestor;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const ANSWER: &str = "Entropy measures disorder.";

#[derive(Clone, Copy)]
enum AnswerMode {
    Answer,
    Fail,
    Hang,
}

/// Answers planning calls with fixed JSON and final calls per `mode`
struct PipelineGenerator {
    analysis: String,
    mode: AnswerMode,
    answer_calls: AtomicUsize,
    last_answer_request: Mutex<Option<CompletionRequest>>,
}

impl PipelineGenerator {
    fn answer_calls(&self) -> usize {
        self.answer_calls.load(Ordering::SeqCst)
    }

    fn last_user_message(&self) -> String {
        self.last_answer_request
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|r| r.messages.last().cloned())
            .map(|m| m.content)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Generator for PipelineGenerator {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        if request.system_prompt.starts_with("You decide how to search") {
            return Ok(format!("```json\n{}\n```", self.analysis));
        }
        if request.system_prompt.starts_with("You check whether") {
            return Ok(r#"{"context_sufficient": true}"#.to_string());
        }

        self.answer_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_answer_request.lock().unwrap() = Some(request);
        match self.mode {
            AnswerMode::Answer => Ok(ANSWER.to_string()),
            AnswerMode::Fail => Err(AppError::Generation {
                message: "upstream 500".to_string(),
            }),
            AnswerMode::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("too late".to_string())
            }
        }
    }

    fn model_name(&self) -> &str {
        "pipeline-test"
    }
}

struct Harness {
    engine: Arc<RagEngine>,
    ingestor: Arc<Ingestor>,
    sessions: Arc<SessionStore>,
    generator: Arc<PipelineGenerator>,
    _dir: tempfile::TempDir,
}

async fn harness(analysis: &str, mode: AnswerMode) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.fallback.data_dir = dir.path().to_path_buf();
    config.generation.timeout_secs = 1;
    config.planner.similarity_threshold = -1.0;

    let store = Arc::new(CacheStore::new(None, &config.redis, &config.fallback).await.unwrap());
    let generator = Arc::new(PipelineGenerator {
        analysis: analysis.to_string(),
        mode,
        answer_calls: AtomicUsize::new(0),
        last_answer_request: Mutex::new(None),
    });
    let embedder = ResilientEmbedder::new(Arc::new(HashEmbedder::new(32)), &EmbeddingConfig::default());
    let index: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new());

    let engine = Arc::new(RagEngine::new(
        &config,
        generator.clone(),
        embedder.clone(),
        index.clone(),
        Arc::new(LexicalOverlapScorer::default()),
        store.clone(),
    ));
    let ingestor = Arc::new(Ingestor::new(&config.chunking, embedder, index, store.clone()));
    let sessions = Arc::new(SessionStore::new(store, &config.session));

    Harness {
        engine,
        ingestor,
        sessions,
        generator,
        _dir: dir,
    }
}

async fn seed(h: &Harness) {
    let documents = vec![
        Document::new(
            "Entropy measures the disorder of a thermodynamic system.\n\n\
             The second law says entropy never decreases in an isolated system.",
        )
        .with_id("thermo")
        .with_metadata("title", "Thermodynamics")
        .with_metadata("source", "thermo.md"),
        Document::new("Photons are quanta of light.\n\nThey carry no rest mass.")
            .with_id("optics")
            .with_metadata("title", "Optics"),
    ];
    h.ingestor.ingest_batch(documents, "physics").await.unwrap();
}

const SEARCH_ENTROPY: &str = r#"{"needs_retrieval": true, "search_queries": ["entropy"]}"#;

#[tokio::test]
async fn test_query_round_trip_through_cache() {
    let h = harness(SEARCH_ENTROPY, AnswerMode::Answer).await;
    seed(&h).await;

    let request = QueryRequest::new("What does entropy measure?").with_partition("physics");
    let first = assert_ok!(h.engine.process_query(request.clone()).await);

    assert_eq!(first.response, ANSWER);
    assert!(first.rag_enhanced);
    assert!(!first.cached);
    assert!(first.retrieval_count > 0);
    assert!(!first.sources_used.is_empty() && first.sources_used.len() <= 3);
    assert!(first.sources_used.iter().all(|s| s.content.ends_with("...")));
    assert_eq!(first.queries_used, vec!["entropy"]);
    assert!(h.generator.last_user_message().contains("Document 1"));

    let second = h.engine.process_query(request).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.processing_time, 0.0);
    assert_eq!(second.response, first.response);
    assert_eq!(second.sources_used, first.sources_used);
    assert_eq!(h.generator.answer_calls(), 1);
}

#[tokio::test]
async fn test_reranking_prefers_lexical_match() {
    let h = harness(SEARCH_ENTROPY, AnswerMode::Answer).await;
    seed(&h).await;

    let response = h
        .engine
        .process_query(
            QueryRequest::new("entropy disorder thermodynamic system")
                .with_partition("physics")
                .with_top_n(1)
                .with_cache(false),
        )
        .await
        .unwrap();

    assert_eq!(response.reranked_count, 1);
    assert_eq!(response.sources_used.len(), 1);
    assert!(response.sources_used[0].content.contains("Entropy"));
    assert_eq!(response.sources_used[0].metadata["title"], json!("Thermodynamics"));
}

#[tokio::test]
async fn test_no_retrieval_needed_answers_unaugmented() {
    let h = harness(r#"{"needs_retrieval": false, "reasoning": "small talk"}"#, AnswerMode::Answer).await;
    seed(&h).await;

    let response = h
        .engine
        .process_query(QueryRequest::new("Hello!").with_partition("physics"))
        .await
        .unwrap();

    assert_eq!(response.response, ANSWER);
    assert!(!response.rag_enhanced);
    assert_eq!(response.retrieval_count, 0);
    assert!(response.sources_used.is_empty());
    assert!(h.generator.last_user_message().contains("No relevant documents found."));
}

#[tokio::test]
async fn test_empty_partition_still_answers() {
    let h = harness("not json at all", AnswerMode::Answer).await;

    let response = h
        .engine
        .process_query(QueryRequest::new("What is entropy?").with_partition("empty"))
        .await
        .unwrap();

    assert_eq!(response.response, ANSWER);
    assert!(!response.rag_enhanced);
    assert_eq!(response.queries_used, vec!["What is entropy?"]);
}

#[tokio::test]
async fn test_generation_failure_returns_apology_uncached() {
    let h = harness(SEARCH_ENTROPY, AnswerMode::Fail).await;
    seed(&h).await;

    let request = QueryRequest::new("What is entropy?").with_partition("physics");
    let first = h.engine.process_query(request.clone()).await.unwrap();
    assert_eq!(first.response, APOLOGY_RESPONSE);
    assert!(first.error.as_deref().is_some_and(|e| e.contains("upstream 500")));
    assert!(!first.rag_enhanced);
    assert!(first.sources_used.is_empty());

    let second = h.engine.process_query(request).await.unwrap();
    assert!(!second.cached);
    assert_eq!(h.generator.answer_calls(), 2);
}

#[tokio::test]
async fn test_generation_timeout_is_surfaced() {
    let h = harness(SEARCH_ENTROPY, AnswerMode::Hang).await;
    seed(&h).await;

    let err = assert_err!(
        h.engine
            .process_query(QueryRequest::new("What is entropy?").with_partition("physics"))
            .await
    );
    assert!(matches!(err, AppError::GenerationTimeout { timeout_secs: 1 }));
}

#[tokio::test]
async fn test_blank_query_rejected() {
    let h = harness(SEARCH_ENTROPY, AnswerMode::Answer).await;
    let err = assert_err!(h.engine.process_query(QueryRequest::new("   ")).await);
    assert!(matches!(err, AppError::Validation { .. }));
    assert_eq!(h.generator.answer_calls(), 0);
}

#[tokio::test]
async fn test_history_bypasses_cache_and_is_forwarded() {
    let h = harness(SEARCH_ENTROPY, AnswerMode::Answer).await;
    seed(&h).await;

    let history = vec![
        ChatMessage::system("ignored"),
        ChatMessage::user("Tell me about heat."),
        ChatMessage::assistant("Heat is energy in transfer."),
    ];
    let request = QueryRequest::new("And entropy?")
        .with_partition("physics")
        .with_history(history);

    let first = h.engine.process_query(request.clone()).await.unwrap();
    let second = h.engine.process_query(request).await.unwrap();
    assert!(!first.cached && !second.cached);
    assert_eq!(h.generator.answer_calls(), 2);

    let sent = h.generator.last_answer_request.lock().unwrap().clone().unwrap();
    assert_eq!(sent.messages.len(), 3);
    assert_eq!(sent.messages[0].content, "Tell me about heat.");
}

#[tokio::test]
async fn test_equivalent_filters_hit_same_cache_entry() {
    let h = harness(SEARCH_ENTROPY, AnswerMode::Answer).await;
    seed(&h).await;

    let f1 = Filter::new().with("title", json!(["Thermodynamics", "Optics"]));
    let f2 = Filter::new().with("title", json!(["Optics", "Thermodynamics", "Optics"]));

    let first = h
        .engine
        .process_query(QueryRequest::new("entropy").with_partition("physics").with_filter(f1))
        .await
        .unwrap();
    let second = h
        .engine
        .process_query(QueryRequest::new("  Entropy ").with_partition("physics").with_filter(f2))
        .await
        .unwrap();

    assert!(!first.cached);
    assert!(second.cached);
}

#[tokio::test]
async fn test_ingestion_invalidates_cached_answers() {
    let h = harness(SEARCH_ENTROPY, AnswerMode::Answer).await;
    seed(&h).await;

    let request = QueryRequest::new("What is entropy?").with_partition("physics");
    h.engine.process_query(request.clone()).await.unwrap();
    assert!(h.engine.process_query(request.clone()).await.unwrap().cached);

    h.ingestor
        .ingest(Document::new("Entropy has units of joules per kelvin.").with_id("units"), "physics")
        .await
        .unwrap();

    assert!(!h.engine.process_query(request).await.unwrap().cached);
}

#[tokio::test]
async fn test_chat_turn_records_transcript() {
    let h = harness(SEARCH_ENTROPY, AnswerMode::Answer).await;
    seed(&h).await;
    let service = Service::new(h.engine.clone(), h.ingestor.clone(), h.sessions.clone());

    let created = service
        .handle(Command::CreateChat {
            user_id: "u1".into(),
            partition_key: "physics".into(),
            title: Some("Thermo".into()),
            system_prompt: Some("Answer briefly.".into()),
        })
        .await;
    assert!(created.ok);
    let chat_id = created.result.unwrap()["id"].as_str().unwrap().to_string();

    let turn = service
        .handle(Command::Chat {
            chat_id: chat_id.clone(),
            user_id: "u1".into(),
            message: "What is entropy?".into(),
        })
        .await;
    assert!(turn.ok);
    assert_eq!(turn.result.unwrap()["response"], json!(ANSWER));

    let sent = h.generator.last_answer_request.lock().unwrap().clone().unwrap();
    assert_eq!(sent.system_prompt, "Answer briefly.");

    let transcript = h.sessions.history(&chat_id, "u1", None).await.unwrap();
    let contents: Vec<&str> = transcript.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["Answer briefly.", "What is entropy?", ANSWER]);
    assert!(transcript[2].metadata.contains_key("sources"));

    let denied = service
        .handle(Command::History {
            chat_id,
            user_id: "someone-else".into(),
            limit: None,
        })
        .await;
    assert!(!denied.ok);
}

#[tokio::test]
async fn test_malformed_command_line() {
    let h = harness(SEARCH_ENTROPY, AnswerMode::Answer).await;
    let service = Service::new(h.engine.clone(), h.ingestor.clone(), h.sessions.clone());

    let reply = service.handle_line("{\"op\": \"query\"").await;
    assert!(!reply.ok);

    let reply = service.handle_line(r#"{"op": "status"}"#).await;
    assert!(reply.ok);
    assert_eq!(reply.result.unwrap()["store_degraded"], json!(false));
}

fn reply_lines(output: &[u8]) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_serve_replies_in_input_order() {
    let h = harness(SEARCH_ENTROPY, AnswerMode::Answer).await;
    seed(&h).await;
    let service = Arc::new(Service::new(h.engine.clone(), h.ingestor.clone(), h.sessions.clone()));

    let input = concat!(
        r#"{"op": "query", "query": "What is entropy?", "partition_key": "physics"}"#,
        "\n\n",
        "not json\n",
        r#"{"op": "status"}"#,
        "\n",
    );
    let mut output = Vec::new();
    assert_ok!(service.serve(input.as_bytes(), &mut output).await);

    let replies = reply_lines(&output);
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0]["result"]["response"], json!(ANSWER));
    assert_eq!(replies[1]["ok"], json!(false));
    assert_eq!(replies[1]["error"]["code"], json!("INVALID_FORMAT"));
    assert_eq!(replies[2]["result"]["store_degraded"], json!(false));
}

#[tokio::test]
async fn test_serve_runs_commands_concurrently() {
    let h = harness(SEARCH_ENTROPY, AnswerMode::Hang).await;
    let service = Arc::new(Service::new(h.engine.clone(), h.ingestor.clone(), h.sessions.clone()));

    let input = concat!(
        r#"{"op": "query", "query": "first", "use_cache": false}"#,
        "\n",
        r#"{"op": "query", "query": "second", "use_cache": false}"#,
        "\n",
    );
    let mut output = Vec::new();
    let start = std::time::Instant::now();
    assert_ok!(service.serve(input.as_bytes(), &mut output).await);

    // Each query waits out the 1s generation timeout; serially that is 2s
    assert!(start.elapsed() < Duration::from_millis(1_900));
    let replies = reply_lines(&output);
    assert_eq!(replies.len(), 2);
    assert!(replies
        .iter()
        .all(|r| r["error"]["code"] == json!("GENERATION_TIMEOUT")));
}

/// In-memory remote that can be switched off
#[derive(Default)]
struct SwitchableRemote {
    down: AtomicBool,
    values: Mutex<HashMap<String, String>>,
    streams: Mutex<HashMap<String, Vec<StreamEntry>>>,
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl SwitchableRemote {
    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(AppError::Store {
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for SwitchableRemote {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn apply(&self, ops: &[StoreOp]) -> Result<()> {
        self.check()?;
        for op in ops {
            match op {
                StoreOp::Set { key, value, .. } => {
                    self.values.lock().unwrap().insert(key.clone(), value.clone());
                }
                StoreOp::Delete { key } => {
                    self.values.lock().unwrap().remove(key);
                    self.streams.lock().unwrap().remove(key);
                    self.sets.lock().unwrap().remove(key);
                }
                StoreOp::StreamAppend { stream, op_id, payload } => {
                    let mut streams = self.streams.lock().unwrap();
                    let entries = streams.entry(stream.clone()).or_default();
                    if !entries.iter().any(|e| &e.op_id == op_id) {
                        entries.push(StreamEntry {
                            op_id: op_id.clone(),
                            payload: payload.clone(),
                        });
                    }
                }
                StoreOp::AddMember { key, member } => {
                    self.sets.lock().unwrap().entry(key.clone()).or_default().insert(member.clone());
                }
                StoreOp::RemoveMember { key, member } => {
                    if let Some(set) = self.sets.lock().unwrap().get_mut(key) {
                        set.remove(member);
                    }
                }
            }
        }
        Ok(())
    }

    async fn read_stream(&self, stream: &str) -> Result<Vec<StreamEntry>> {
        self.check()?;
        Ok(self.streams.lock().unwrap().get(stream).cloned().unwrap_or_default())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(self
            .sets
            .lock()
            .unwrap()
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        let mut keys: Vec<String> = self
            .values
            .lock()
            .unwrap()
            .keys()
            .chain(self.streams.lock().unwrap().keys())
            .chain(self.sets.lock().unwrap().keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

#[tokio::test]
async fn test_chat_created_during_outage_is_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(SwitchableRemote::default());
    let redis = RedisConfig {
        reconnect_interval_secs: 0,
        ..RedisConfig::default()
    };
    let fallback = FallbackConfig {
        data_dir: dir.path().to_path_buf(),
        ..FallbackConfig::default()
    };
    let store = Arc::new(CacheStore::new(Some(remote.clone()), &redis, &fallback).await.unwrap());
    let sessions = SessionStore::new(store.clone(), &Default::default());

    remote.down.store(true, Ordering::SeqCst);
    let chat = sessions.create_chat("u1", "physics", None, "sys").await.unwrap();
    assert!(store.is_degraded());
    assert_eq!(store.pending_count().await, 1);

    // Served from the local fallback while the remote is down
    assert_eq!(sessions.get_chat(&chat.id, "u1").await.unwrap().id, chat.id);

    remote.down.store(false, Ordering::SeqCst);
    let report = store.recover().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(store.pending_count().await, 0);
    assert!(!store.is_degraded());

    assert!(remote.values.lock().unwrap().contains_key(&format!("chat:{}", chat.id)));
    let history = sessions.history(&chat.id, "u1", None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "sys");
}
