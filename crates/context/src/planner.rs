//! Multi-hop retrieval planner
//!
//! Runs `Analyze -> (Retrieve <-> Expand)* -> Done`:
//! - Analyze asks the generator whether retrieval is needed and for the
//!   initial search queries and filters
//! - Retrieve pops one queued query and searches the vector index
//! - Expand asks the generator for follow-up queries when too little was found
//!
//! Generator replies are untrusted. Anything that fails to parse falls back
//! to a conservative default instead of failing the request.

use crate::assembler::{format_contexts, truncate_context};
use crate::generator::{complete_with_timeout, ChatMessage, CompletionRequest, Generator};
use ragforge_common::config::PlannerConfig;
use ragforge_common::embeddings::ResilientEmbedder;
use ragforge_common::index::VectorIndex;
use ragforge_common::metrics;
use ragforge_common::models::{Filter, RetrievalCandidate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const ANALYZE_PROMPT: &str = "You decide how to search a knowledge base before a question is answered. \
Reply with a single JSON object and nothing else, with these fields:\n\
- needs_retrieval: boolean, false only when the question can be answered without any documents\n\
- search_queries: array of 1 to 3 short search queries\n\
- filters: object mapping metadata fields to a value or an array of allowed values, usually empty\n\
- reasoning: one sentence explaining the decision";

const FOLLOW_UP_PROMPT: &str = "You check whether retrieved context is enough to answer a question. \
Reply with a single JSON object and nothing else, with these fields:\n\
- context_sufficient: boolean\n\
- follow_up_queries: array of new search queries for missing information, empty when sufficient\n\
- filters: object of additional metadata filters, usually empty\n\
- reasoning: one sentence";

/// Structured analysis reply
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct QueryAnalysis {
    needs_retrieval: bool,
    search_queries: Vec<String>,
    filters: Filter,
    reasoning: String,
}

impl Default for QueryAnalysis {
    fn default() -> Self {
        Self {
            needs_retrieval: true,
            search_queries: Vec::new(),
            filters: Filter::new(),
            reasoning: String::new(),
        }
    }
}

/// Structured follow-up reply
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FollowUpAnalysis {
    context_sufficient: bool,
    follow_up_queries: Vec<String>,
    filters: Filter,
    reasoning: String,
}

/// Queries and filters actually used for one request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalPlan {
    pub queries: Vec<String>,
    pub filters: Filter,
    pub iterations_used: usize,
    pub reasoning: String,
}

/// Result of planning and retrieval
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanOutcome {
    /// Deduplicated candidates, best first, at most `top_k`
    pub contexts: Vec<RetrievalCandidate>,
    pub formatted_context: String,
    pub queries_used: Vec<String>,
    /// False when the iteration cap cut planning short
    pub complete: bool,
    pub plan: RetrievalPlan,
    pub reasoning: String,
}

/// Where and how much to retrieve
#[derive(Debug, Clone)]
pub struct RetrievalScope {
    pub partition: String,
    pub filter: Filter,
    pub top_k: usize,
}

impl RetrievalScope {
    pub fn new(partition: impl Into<String>, top_k: usize) -> Self {
        Self {
            partition: partition.into(),
            filter: Filter::new(),
            top_k,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlannerState {
    Retrieve,
    Expand,
    Done,
}

/// Extract the JSON object from a model reply
///
/// Tolerates code fences and prose around the object.
pub fn extract_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

fn parse_reply<T: DeserializeOwned>(reply: &str) -> Option<T> {
    let json = extract_json_object(reply)?;
    match serde_json::from_str(json) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            debug!(error = %e, "Structured reply did not match schema");
            None
        }
    }
}

fn sanitize_queries(queries: Vec<String>) -> Vec<String> {
    queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect()
}

/// Multi-hop retrieval planner
pub struct QueryPlanner {
    generator: Arc<dyn Generator>,
    embedder: ResilientEmbedder,
    index: Arc<dyn VectorIndex>,
    config: PlannerConfig,
    timeout: Duration,
}

impl QueryPlanner {
    pub fn new(
        generator: Arc<dyn Generator>,
        embedder: ResilientEmbedder,
        index: Arc<dyn VectorIndex>,
        config: PlannerConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            generator,
            embedder,
            index,
            config,
            timeout,
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    async fn structured_call<T: DeserializeOwned>(&self, system_prompt: &str, user: String) -> Option<T> {
        let request = CompletionRequest::new(system_prompt, vec![ChatMessage::user(user)])
            .with_temperature(0.0)
            .with_timeout(self.timeout);

        match complete_with_timeout(self.generator.as_ref(), request).await {
            Ok(reply) => parse_reply(&reply),
            Err(e) => {
                warn!(error = %e, "Structured planning call failed");
                None
            }
        }
    }

    async fn analyze(&self, query: &str) -> QueryAnalysis {
        match self.structured_call::<QueryAnalysis>(ANALYZE_PROMPT, format!("Question: {}", query)).await {
            Some(analysis) => {
                debug!(reasoning = %analysis.reasoning, "Query analysis complete");
                analysis
            }
            None => {
                warn!("Query analysis unusable, searching with the original query");
                QueryAnalysis {
                    reasoning: "Analysis unavailable; using the original query".to_string(),
                    ..QueryAnalysis::default()
                }
            }
        }
    }

    async fn follow_up(&self, query: &str, gathered: &[RetrievalCandidate]) -> FollowUpAnalysis {
        let context = format_contexts(gathered, false);
        let context = truncate_context(context, self.config.max_context_length);
        let user = format!(
            "Question: {}\n\nContext gathered so far:\n{}",
            query,
            if context.is_empty() { "(nothing found yet)" } else { context.as_str() }
        );

        match self.structured_call::<FollowUpAnalysis>(FOLLOW_UP_PROMPT, user).await {
            Some(analysis) => analysis,
            None => FollowUpAnalysis {
                context_sufficient: true,
                ..FollowUpAnalysis::default()
            },
        }
    }

    /// One retrieval hop; failures count as zero results
    async fn retrieve(&self, query: &str, scope: &RetrievalScope, filters: &Filter) -> Vec<RetrievalCandidate> {
        let embedding = self.embedder.embed(query).await;
        match self
            .index
            .search(&embedding, scope.top_k, &scope.partition, filters)
            .await
        {
            Ok(hits) => hits
                .into_iter()
                .filter(|hit| hit.score >= self.config.similarity_threshold)
                .collect(),
            Err(e) => {
                warn!(query, partition = %scope.partition, error = %e, "Retrieval hop failed");
                Vec::new()
            }
        }
    }

    /// Plan, retrieve and assemble context for `query`
    ///
    /// Never fails: the worst case is an empty context.
    #[instrument(skip(self, scope), fields(partition = %scope.partition, top_k = scope.top_k))]
    pub async fn plan_and_retrieve(
        &self,
        query: &str,
        scope: &RetrievalScope,
        max_iterations: Option<usize>,
    ) -> PlanOutcome {
        let max_iterations = max_iterations.unwrap_or(self.config.max_iterations);
        let top_k = scope.top_k;
        let analysis = self.analyze(query).await;

        if !analysis.needs_retrieval {
            info!(reasoning = %analysis.reasoning, "Retrieval not needed");
            return PlanOutcome {
                queries_used: vec![query.to_string()],
                complete: true,
                plan: RetrievalPlan {
                    queries: Vec::new(),
                    filters: Filter::new(),
                    iterations_used: 0,
                    reasoning: analysis.reasoning.clone(),
                },
                reasoning: analysis.reasoning,
                ..PlanOutcome::default()
            };
        }

        let mut queue: VecDeque<String> = sanitize_queries(analysis.search_queries).into();
        if queue.is_empty() {
            queue.push_back(query.to_string());
        }

        let mut filters = analysis.filters;
        filters.merge(&scope.filter);

        let sufficient = self.config.sufficiency_factor.max(1) * top_k;
        let mut gathered: Vec<RetrievalCandidate> = Vec::new();
        let mut queries_used: Vec<String> = Vec::new();
        let mut seen_queries: HashSet<String> = HashSet::new();
        let mut iterations = 0;
        let mut state = PlannerState::Retrieve;

        while state != PlannerState::Done {
            state = match state {
                PlannerState::Retrieve => {
                    if iterations >= max_iterations {
                        PlannerState::Done
                    } else {
                        let next = std::iter::from_fn(|| queue.pop_front())
                            .find(|q| !self.config.dedupe_queries || !seen_queries.contains(&q.to_lowercase()));

                        match next {
                            None => PlannerState::Done,
                            Some(current) => {
                                iterations += 1;
                                seen_queries.insert(current.to_lowercase());
                                let hits = self.retrieve(&current, scope, &filters).await;
                                debug!(hop = iterations, query = %current, hits = hits.len(), "Retrieval hop");
                                queries_used.push(current);
                                gathered.extend(hits);

                                if gathered.len() >= sufficient {
                                    PlannerState::Done
                                } else if gathered.len() < top_k && iterations < max_iterations {
                                    PlannerState::Expand
                                } else {
                                    PlannerState::Retrieve
                                }
                            }
                        }
                    }
                }
                PlannerState::Expand => {
                    let follow_up = self.follow_up(query, &gathered).await;
                    let new_queries = sanitize_queries(follow_up.follow_up_queries);
                    if !follow_up.filters.is_empty() {
                        filters.merge(&follow_up.filters);
                        filters.merge(&scope.filter);
                    }

                    if follow_up.context_sufficient {
                        debug!(reasoning = %follow_up.reasoning, "Follow-up reports sufficient context");
                        PlannerState::Done
                    } else {
                        queue.extend(new_queries);
                        if queue.is_empty() {
                            PlannerState::Done
                        } else {
                            PlannerState::Retrieve
                        }
                    }
                }
                PlannerState::Done => PlannerState::Done,
            };
        }

        let complete = queue.is_empty() || iterations < max_iterations;
        metrics::record_retrieval_hops(iterations);

        let contexts = merge_candidates(gathered, top_k);
        let formatted_context = truncate_context(
            format_contexts(&contexts, self.config.include_metadata),
            self.config.max_context_length,
        );

        info!(
            hops = iterations,
            candidates = contexts.len(),
            queries = queries_used.len(),
            complete,
            "Multi-hop retrieval finished"
        );

        PlanOutcome {
            contexts,
            formatted_context,
            queries_used: queries_used.clone(),
            complete,
            plan: RetrievalPlan {
                queries: queries_used,
                filters,
                iterations_used: iterations,
                reasoning: analysis.reasoning.clone(),
            },
            reasoning: analysis.reasoning,
        }
    }
}

/// Dedupe by chunk id (first wins), stable sort by score, keep `top_k`
pub fn merge_candidates(candidates: Vec<RetrievalCandidate>, top_k: usize) -> Vec<RetrievalCandidate> {
    let mut seen = HashSet::new();
    let mut unique: Vec<RetrievalCandidate> = candidates
        .into_iter()
        .filter(|c| seen.insert(c.chunk_id.clone()))
        .collect();
    unique.sort_by(|a, b| b.score.total_cmp(&a.score));
    unique.truncate(top_k);
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ragforge_common::config::EmbeddingConfig;
    use ragforge_common::embeddings::HashEmbedder;
    use ragforge_common::errors::{AppError, Result};
    use ragforge_common::models::Chunk;
    use serde_json::json;
    use std::sync::Mutex;

    /// Replies in order; the last reply repeats
    struct ScriptedGenerator {
        replies: Mutex<VecDeque<String>>,
        calls: Mutex<usize>,
    }

    impl ScriptedGenerator {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn complete(&self, _request: CompletionRequest) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                Ok(replies.pop_front().unwrap_or_default())
            } else {
                Ok(replies.front().cloned().unwrap_or_default())
            }
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    struct CountingIndex {
        hits: Vec<RetrievalCandidate>,
        searches: Mutex<Vec<Filter>>,
        fail: bool,
    }

    impl CountingIndex {
        fn new(hits: Vec<RetrievalCandidate>) -> Arc<Self> {
            Arc::new(Self {
                hits,
                searches: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                hits: Vec::new(),
                searches: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn searches(&self) -> usize {
            self.searches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl VectorIndex for CountingIndex {
        async fn search(&self, _e: &[f32], top_k: usize, _p: &str, filter: &Filter) -> Result<Vec<RetrievalCandidate>> {
            self.searches.lock().unwrap().push(filter.clone());
            if self.fail {
                return Err(AppError::VectorIndex {
                    message: "index offline".into(),
                });
            }
            Ok(self.hits.iter().take(top_k).cloned().collect())
        }

        async fn upsert(&self, _chunks: &[Chunk], _p: &str) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _ids: &[String], _p: &str) -> Result<usize> {
            Ok(0)
        }

        async fn delete_by_parent(&self, _parent: &str, _p: &str) -> Result<usize> {
            Ok(0)
        }

        async fn delete_partition(&self, _p: &str) -> Result<usize> {
            Ok(0)
        }
    }

    fn planner(generator: Arc<dyn Generator>, index: Arc<dyn VectorIndex>) -> QueryPlanner {
        let embedder = ResilientEmbedder::new(Arc::new(HashEmbedder::new(8)), &EmbeddingConfig::default());
        QueryPlanner::new(generator, embedder, index, PlannerConfig::default(), Duration::from_secs(1))
    }

    fn hits(ids: &[(&str, f32)]) -> Vec<RetrievalCandidate> {
        ids.iter()
            .map(|(id, score)| RetrievalCandidate::new(*id, format!("content of {}", id), *score))
            .collect()
    }

    #[test]
    fn test_extract_json_tolerates_fences_and_prose() {
        let reply = "Sure! Here it is:\n```json\n{\"needs_retrieval\": false}\n```\nHope that helps.";
        assert_eq!(extract_json_object(reply), Some("{\"needs_retrieval\": false}"));
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("} backwards {"), None);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let analysis: QueryAnalysis = parse_reply(r#"{"search_queries": ["a"]}"#).unwrap();
        assert!(analysis.needs_retrieval);
        assert!(analysis.filters.is_empty());

        assert!(parse_reply::<QueryAnalysis>(r#"{"search_queries": "not a list"}"#).is_none());
    }

    #[test]
    fn test_merge_dedupes_first_wins_and_sorts() {
        let mut candidates = hits(&[("a", 0.2), ("b", 0.9), ("c", 0.5)]);
        candidates.push(RetrievalCandidate::new("a", "duplicate", 0.99));

        let merged = merge_candidates(candidates, 2);
        let ids: Vec<&str> = merged.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(merged.iter().all(|c| c.content != "duplicate"));
    }

    #[tokio::test]
    async fn test_no_retrieval_needed() {
        let generator = ScriptedGenerator::new(&[r#"{"needs_retrieval": false, "reasoning": "greeting"}"#]);
        let index = CountingIndex::new(hits(&[("a", 0.9)]));
        let outcome = planner(generator, index.clone())
            .plan_and_retrieve("hello there", &RetrievalScope::new("p", 5), None)
            .await;

        assert!(outcome.contexts.is_empty());
        assert!(outcome.complete);
        assert_eq!(outcome.queries_used, vec!["hello there"]);
        assert_eq!(outcome.reasoning, "greeting");
        assert_eq!(index.searches(), 0);
    }

    #[tokio::test]
    async fn test_malformed_analysis_uses_original_query() {
        let generator = ScriptedGenerator::new(&["I think you should search for stuff."]);
        let index = CountingIndex::new(hits(&[("a", 0.9), ("b", 0.8)]));
        let outcome = planner(generator, index.clone())
            .plan_and_retrieve("what is entropy", &RetrievalScope::new("p", 2), None)
            .await;

        assert_eq!(outcome.queries_used, vec!["what is entropy"]);
        assert_eq!(outcome.contexts.len(), 2);
        assert_eq!(index.searches(), 1);
        assert!(outcome.formatted_context.starts_with("Document 1:"));
    }

    #[tokio::test]
    async fn test_stops_at_sufficiency() {
        let generator = ScriptedGenerator::new(&[r#"{"search_queries": ["q1", "q2", "q3"]}"#]);
        let index = CountingIndex::new(hits(&[("a", 0.9), ("b", 0.8), ("c", 0.7), ("d", 0.6)]));
        let outcome = planner(generator, index.clone())
            .plan_and_retrieve("q", &RetrievalScope::new("p", 2), None)
            .await;

        // Two hops of 2 hits reach 2 x top_k; q3 is never issued
        assert_eq!(index.searches(), 2);
        assert_eq!(outcome.queries_used, vec!["q1", "q2"]);
        assert_eq!(outcome.contexts.len(), 2);
        assert!(outcome.complete);
    }

    #[tokio::test]
    async fn test_duplicate_hits_across_hops_are_merged() {
        let generator = ScriptedGenerator::new(&[r#"{"search_queries": ["q1", "q2"]}"#]);
        let index = CountingIndex::new(hits(&[("a", 0.9), ("b", 0.8), ("c", 0.7)]));
        let outcome = planner(generator, index.clone())
            .plan_and_retrieve("q", &RetrievalScope::new("p", 3), None)
            .await;

        // 3 hits then 6: second hop reaches 2 x top_k
        assert_eq!(index.searches(), 2);
        let ids: Vec<&str> = outcome.contexts.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_empty_hop_expands_then_stops_at_max_iterations() {
        let generator = ScriptedGenerator::new(&[
            r#"{"search_queries": ["first"]}"#,
            r#"{"context_sufficient": false, "follow_up_queries": ["second"]}"#,
            r#"{"context_sufficient": false, "follow_up_queries": ["third"]}"#,
            r#"{"context_sufficient": false, "follow_up_queries": ["fourth"]}"#,
        ]);
        let index = CountingIndex::new(Vec::new());
        let outcome = planner(generator.clone(), index.clone())
            .plan_and_retrieve("q", &RetrievalScope::new("p", 3), Some(3))
            .await;

        assert_eq!(index.searches(), 3);
        assert_eq!(outcome.queries_used, vec!["first", "second", "third"]);
        assert_eq!(outcome.plan.iterations_used, 3);
        assert!(outcome.contexts.is_empty());
        assert!(outcome.formatted_context.is_empty());
        // analyze + two follow-ups; no expansion after the last hop
        assert_eq!(generator.calls(), 3);
    }

    #[tokio::test]
    async fn test_malformed_follow_up_ends_expansion() {
        let generator = ScriptedGenerator::new(&[r#"{"search_queries": ["first"]}"#, "garbage"]);
        let index = CountingIndex::new(Vec::new());
        let outcome = planner(generator, index.clone())
            .plan_and_retrieve("q", &RetrievalScope::new("p", 3), None)
            .await;

        assert_eq!(index.searches(), 1);
        assert!(outcome.complete);
    }

    #[tokio::test]
    async fn test_reissued_queries_are_skipped() {
        let generator = ScriptedGenerator::new(&[
            r#"{"search_queries": ["alpha"]}"#,
            r#"{"follow_up_queries": ["Alpha", "beta"]}"#,
            r#"{"follow_up_queries": []}"#,
        ]);
        let index = CountingIndex::new(Vec::new());
        let outcome = planner(generator, index.clone())
            .plan_and_retrieve("q", &RetrievalScope::new("p", 3), None)
            .await;

        assert_eq!(outcome.queries_used, vec!["alpha", "beta"]);
        assert_eq!(index.searches(), 2);
    }

    #[tokio::test]
    async fn test_failed_hops_yield_empty_context() {
        let generator = ScriptedGenerator::new(&[r#"{"search_queries": ["a"]}"#, "{}"]);
        let outcome = planner(generator, CountingIndex::failing())
            .plan_and_retrieve("q", &RetrievalScope::new("p", 3), None)
            .await;

        assert!(outcome.contexts.is_empty());
        assert!(outcome.formatted_context.is_empty());
    }

    #[tokio::test]
    async fn test_request_filter_overrides_model_filters() {
        let generator = ScriptedGenerator::new(&[
            r#"{"search_queries": ["a"], "filters": {"lang": "fr", "topic": "optics"}}"#,
        ]);
        let index = CountingIndex::new(hits(&[("a", 0.9), ("b", 0.8)]));
        let scope = RetrievalScope::new("p", 1).with_filter(Filter::new().with("lang", "en"));
        let outcome = planner(generator, index.clone()).plan_and_retrieve("q", &scope, None).await;

        let used = index.searches.lock().unwrap()[0].clone();
        assert_eq!(used, Filter::new().with("lang", "en").with("topic", json!("optics")));
        assert_eq!(outcome.plan.filters, used);
    }

    #[tokio::test]
    async fn test_repeated_runs_are_identical() {
        let reply = r#"{"search_queries": ["a", "b"]}"#;
        let index = CountingIndex::new(hits(&[("x", 0.3), ("y", 0.7), ("z", 0.5)]));
        let scope = RetrievalScope::new("p", 2);

        let first = planner(ScriptedGenerator::new(&[reply]), index.clone())
            .plan_and_retrieve("q", &scope, None)
            .await;
        let second = planner(ScriptedGenerator::new(&[reply]), index.clone())
            .plan_and_retrieve("q", &scope, None)
            .await;

        assert_eq!(first.contexts, second.contexts);
        assert_eq!(first.formatted_context, second.formatted_context);
    }
}
