//! Store operations and grouped transactions
//!
//! Every operation is an idempotent upsert: sets and deletes overwrite,
//! membership changes are set semantics, and stream appends carry an op id
//! the remote side deduplicates on. Replaying a transaction is therefore safe.

use super::CacheStore;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single queued write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreOp {
    Set {
        key: String,
        value: String,
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
    Delete {
        key: String,
    },
    StreamAppend {
        stream: String,
        op_id: String,
        payload: String,
    },
    AddMember {
        key: String,
        member: String,
    },
    RemoveMember {
        key: String,
        member: String,
    },
}

impl StoreOp {
    pub fn set(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        StoreOp::Set {
            key: key.into(),
            value: value.into(),
            ttl_secs: ttl.map(|t| t.as_secs().max(1)),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        StoreOp::Delete { key: key.into() }
    }

    /// Stream append with a fresh op id
    pub fn append(stream: impl Into<String>, payload: impl Into<String>) -> Self {
        StoreOp::StreamAppend {
            stream: stream.into(),
            op_id: uuid::Uuid::new_v4().to_string(),
            payload: payload.into(),
        }
    }

    pub fn add_member(key: impl Into<String>, member: impl Into<String>) -> Self {
        StoreOp::AddMember {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn remove_member(key: impl Into<String>, member: impl Into<String>) -> Self {
        StoreOp::RemoveMember {
            key: key.into(),
            member: member.into(),
        }
    }

    /// Key the operation writes to
    pub fn key(&self) -> &str {
        match self {
            StoreOp::Set { key, .. }
            | StoreOp::Delete { key }
            | StoreOp::AddMember { key, .. }
            | StoreOp::RemoveMember { key, .. } => key,
            StoreOp::StreamAppend { stream, .. } => stream,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreOp::Set { .. } => "set",
            StoreOp::Delete { .. } => "delete",
            StoreOp::StreamAppend { .. } => "stream_append",
            StoreOp::AddMember { .. } => "add_member",
            StoreOp::RemoveMember { .. } => "remove_member",
        }
    }
}

/// Result of committing a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOutcome {
    pub id: String,
    /// Every operation reached the remote store
    pub success: bool,
    /// The write-set is persisted on disk awaiting replay
    pub pending: bool,
}

/// Builder for a grouped, best-effort write-set
///
/// Nothing is sent until [`Transaction::commit`].
pub struct Transaction<'a> {
    store: &'a CacheStore,
    id: String,
    ops: Vec<StoreOp>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(store: &'a CacheStore) -> Self {
        Self {
            store,
            id: uuid::Uuid::new_v4().to_string(),
            ops: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn set(mut self, key: &str, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        self.ops.push(StoreOp::set(key, value, ttl));
        self
    }

    pub fn set_json<T: Serialize>(self, key: &str, value: &T, ttl: Option<Duration>) -> crate::Result<Self> {
        let json = serde_json::to_string(value)?;
        Ok(self.set(key, json, ttl))
    }

    pub fn delete(mut self, key: &str) -> Self {
        self.ops.push(StoreOp::delete(key));
        self
    }

    pub fn append(mut self, stream: &str, payload: impl Into<String>) -> Self {
        self.ops.push(StoreOp::append(stream, payload));
        self
    }

    pub fn add_member(mut self, key: &str, member: &str) -> Self {
        self.ops.push(StoreOp::add_member(key, member));
        self
    }

    pub fn remove_member(mut self, key: &str, member: &str) -> Self {
        self.ops.push(StoreOp::remove_member(key, member));
        self
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    /// Dispatch every queued operation together
    pub async fn commit(self) -> TransactionOutcome {
        self.store.execute(self.id, self.ops).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_serialization_is_tagged() {
        let op = StoreOp::set("chat:1", "{}", Some(Duration::from_secs(60)));
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "set");
        assert_eq!(json["ttl_secs"], 60);

        let back: StoreOp = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_appends_get_distinct_op_ids() {
        let a = StoreOp::append("s", "x");
        let b = StoreOp::append("s", "x");
        assert_ne!(a, b);
        assert_eq!(a.key(), "s");
        assert_eq!(a.name(), "stream_append");
    }

    #[test]
    fn test_sub_second_ttl_rounds_up() {
        match StoreOp::set("k", "v", Some(Duration::from_millis(10))) {
            StoreOp::Set { ttl_secs, .. } => assert_eq!(ttl_secs, Some(1)),
            other => panic!("unexpected op {:?}", other),
        }
    }
}
