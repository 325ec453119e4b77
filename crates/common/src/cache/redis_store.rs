//! Redis implementation of [`RemoteStore`]
//!
//! Write-sets go out as one pipeline. Stream appends run through a Lua script
//! that records the op id in a per-stream applied set and only appends when
//! the id is new, so replaying a write-set never duplicates stream entries.

use super::lru::StreamEntry;
use super::transaction::StoreOp;
use super::RemoteStore;
use crate::config::RedisConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use redis::streams::StreamRangeReply;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client, RedisError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const APPEND_ONCE_SCRIPT: &str = r#"
if redis.call('SADD', KEYS[1], ARGV[1]) == 1 then
  return redis.call('XADD', KEYS[2], '*', 'op_id', ARGV[1], 'payload', ARGV[2])
end
return false
"#;

const SCAN_BATCH: usize = 200;

/// Redis client with a lazily (re)established multiplexed connection
pub struct RedisStore {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    key_prefix: String,
}

impl RedisStore {
    /// Create a store; no connection is made until the first call
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| AppError::Configuration {
            message: format!("Invalid Redis URL: {}", e),
        })?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            key_prefix: config.key_prefix.clone(),
        })
    }

    /// Build a prefixed key
    fn key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.key_prefix.is_empty() {
            return key;
        }
        key.strip_prefix(&self.key_prefix)
            .and_then(|k| k.strip_prefix(':'))
            .unwrap_or(key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::Store {
                message: format!("Failed to connect to Redis: {}", e),
            })?;
        debug!("Redis connection established");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drop a broken connection so the next call reconnects
    async fn on_error(&self, err: RedisError, context: &str) -> AppError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            warn!(error = %err, "Redis connection lost, resetting");
            *self.connection.lock().await = None;
        }
        AppError::Store {
            message: format!("{}: {}", context, err),
        }
    }
}

/// Escape glob metacharacters for SCAN MATCH
fn escape_glob(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let full_key = self.key(key);
        let mut conn = self.connection().await?;
        match conn.get::<_, Option<String>>(&full_key).await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.on_error(e, &format!("Failed to get key '{}'", full_key)).await),
        }
    }

    async fn apply(&self, ops: &[StoreOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for op in ops {
            match op {
                StoreOp::Set { key, value, ttl_secs } => match ttl_secs {
                    Some(ttl) => {
                        pipe.set_ex(self.key(key), value, *ttl).ignore();
                    }
                    None => {
                        pipe.set(self.key(key), value).ignore();
                    }
                },
                StoreOp::Delete { key } => {
                    let full_key = self.key(key);
                    pipe.del(vec![full_key.clone(), format!("{}:applied", full_key)]).ignore();
                }
                StoreOp::StreamAppend { stream, op_id, payload } => {
                    let full_key = self.key(stream);
                    pipe.cmd("EVAL")
                        .arg(APPEND_ONCE_SCRIPT)
                        .arg(2)
                        .arg(format!("{}:applied", full_key))
                        .arg(&full_key)
                        .arg(op_id)
                        .arg(payload)
                        .ignore();
                }
                StoreOp::AddMember { key, member } => {
                    pipe.sadd(self.key(key), member).ignore();
                }
                StoreOp::RemoveMember { key, member } => {
                    pipe.srem(self.key(key), member).ignore();
                }
            }
        }

        let mut conn = self.connection().await?;
        match pipe.query_async::<()>(&mut conn).await {
            Ok(()) => {
                debug!(ops = ops.len(), "Pipeline applied");
                Ok(())
            }
            Err(e) => Err(self.on_error(e, "Pipeline failed").await),
        }
    }

    async fn read_stream(&self, stream: &str) -> Result<Vec<StreamEntry>> {
        let full_key = self.key(stream);
        let mut conn = self.connection().await?;
        let reply = match conn.xrange_all::<_, StreamRangeReply>(&full_key).await {
            Ok(reply) => reply,
            Err(e) => {
                return Err(self.on_error(e, &format!("Failed to read stream '{}'", full_key)).await)
            }
        };

        Ok(reply
            .ids
            .into_iter()
            .filter_map(|entry| {
                let payload = entry.get::<String>("payload")?;
                let op_id = entry.get::<String>("op_id").unwrap_or(entry.id);
                Some(StreamEntry { op_id, payload })
            })
            .collect())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        let full_key = self.key(key);
        let mut conn = self.connection().await?;
        match conn.smembers::<_, Vec<String>>(&full_key).await {
            Ok(mut members) => {
                members.sort();
                Ok(members)
            }
            Err(e) => Err(self.on_error(e, &format!("Failed to read set '{}'", full_key)).await),
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", escape_glob(&self.key(prefix)));
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let result: std::result::Result<(u64, Vec<String>), RedisError> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await;
            let (next, batch) = match result {
                Ok(page) => page,
                Err(e) => return Err(self.on_error(e, "SCAN failed").await),
            };
            keys.extend(batch.iter().map(|k| self.strip_prefix(k).to_string()));
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.on_error(e, "Redis ping failed").await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefixing() {
        let store = RedisStore::new(&RedisConfig::default()).unwrap();
        assert_eq!(store.key("chat:1"), "ragforge:chat:1");
        assert_eq!(store.strip_prefix("ragforge:chat:1"), "chat:1");
        assert_eq!(store.strip_prefix("other:chat:1"), "other:chat:1");
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("rag:query:p*1:"), "rag:query:p\\*1:");
        assert_eq!(escape_glob("plain"), "plain");
    }

    #[test]
    fn test_invalid_url_is_configuration_error() {
        let config = RedisConfig {
            url: "not a url".to_string(),
            ..RedisConfig::default()
        };
        assert!(matches!(
            RedisStore::new(&config),
            Err(AppError::Configuration { .. })
        ));
    }
}
