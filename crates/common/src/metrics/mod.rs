//! Metrics and observability utilities
//!
//! Prometheus-style metrics for the query pipeline, the shared store and
//! ingestion, all named `ragforge_*`.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all RagForge metrics
pub const METRICS_PREFIX: &str = "ragforge";

/// Buckets for end-to-end query latency (in seconds)
/// Generation dominates, so the range extends to the generation timeout
pub const QUERY_BUCKETS: &[f64] = &[
    0.010, // 10ms (cache hits)
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
];

/// Buckets for embedding latency
pub const EMBEDDING_BUCKETS: &[f64] = &[
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.000, // 2s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Query metrics
    describe_counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of processed queries"
    );

    describe_histogram!(
        format!("{}_query_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end query latency in seconds"
    );

    describe_histogram!(
        format!("{}_retrieval_hops", METRICS_PREFIX),
        Unit::Count,
        "Retrieval hops performed per query"
    );

    describe_counter!(
        format!("{}_rerank_fail_open_total", METRICS_PREFIX),
        Unit::Count,
        "Reranker failures that fell back to retrieval order"
    );

    describe_counter!(
        format!("{}_generation_timeouts_total", METRICS_PREFIX),
        Unit::Count,
        "Generation calls that exceeded their timeout"
    );

    // Ingestion metrics
    describe_counter!(
        format!("{}_documents_ingested_total", METRICS_PREFIX),
        Unit::Count,
        "Total documents ingested"
    );

    describe_counter!(
        format!("{}_chunks_created_total", METRICS_PREFIX),
        Unit::Count,
        "Total chunks created"
    );

    describe_histogram!(
        format!("{}_ingestion_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Document ingestion latency in seconds"
    );

    // Embedding metrics
    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding provider requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    describe_counter!(
        format!("{}_embedding_fallbacks_total", METRICS_PREFIX),
        Unit::Count,
        "Embeddings served by the deterministic fallback"
    );

    // Store metrics
    describe_counter!(
        format!("{}_store_fallbacks_total", METRICS_PREFIX),
        Unit::Count,
        "Store operations served by the local fallback"
    );

    describe_counter!(
        format!("{}_wal_replays_total", METRICS_PREFIX),
        Unit::Count,
        "Pending transactions replayed from the write-ahead log"
    );

    // Cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
    );

    tracing::info!("Metrics registered");
}

/// Tracks one query from start to response
pub struct QueryMetrics {
    start: Instant,
    partition: String,
}

impl QueryMetrics {
    pub fn start(partition: &str) -> Self {
        Self {
            start: Instant::now(),
            partition: partition.to_string(),
        }
    }

    /// Record query completion
    pub fn finish(self, outcome: &str) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_queries_total", METRICS_PREFIX),
            "partition" => self.partition.clone(),
            "outcome" => outcome.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_query_duration_seconds", METRICS_PREFIX),
            "partition" => self.partition
        )
        .record(duration);
    }
}

pub fn record_retrieval_hops(hops: usize) {
    histogram!(format!("{}_retrieval_hops", METRICS_PREFIX)).record(hops as f64);
}

pub fn record_rerank_fail_open(reason: &str) {
    counter!(
        format!("{}_rerank_fail_open_total", METRICS_PREFIX),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_generation_timeout() {
    counter!(format!("{}_generation_timeouts_total", METRICS_PREFIX)).increment(1);
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, batch_size: usize, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(batch_size as u64);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
    }
}

pub fn record_embedding_fallback(model: &str) {
    counter!(
        format!("{}_embedding_fallbacks_total", METRICS_PREFIX),
        "model" => model.to_string()
    )
    .increment(1);
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, cache_name: &str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    }
}

pub fn record_store_fallback(operation: &str) {
    counter!(
        format!("{}_store_fallbacks_total", METRICS_PREFIX),
        "operation" => operation.to_string()
    )
    .increment(1);
}

pub fn record_wal_replay(success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        format!("{}_wal_replays_total", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Helper to record ingestion metrics
pub fn record_ingestion(duration_secs: f64, chunks_created: usize, partition: &str) {
    counter!(
        format!("{}_documents_ingested_total", METRICS_PREFIX),
        "partition" => partition.to_string()
    )
    .increment(1);

    counter!(
        format!("{}_chunks_created_total", METRICS_PREFIX),
        "partition" => partition.to_string()
    )
    .increment(chunks_created as u64);

    histogram!(format!("{}_ingestion_duration_seconds", METRICS_PREFIX)).record(duration_secs);
}
