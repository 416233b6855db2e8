//! Redis-backed cache mirror (C1).
//!
//! The mirror is never authoritative — it exists for crash recovery and for
//! other processes that want read-only visibility into the registry. Every
//! op maps `redis::RedisError` into [`CacheError::Transient`] or
//! [`CacheError::Permanent`] so the supervisor can decide whether a failed
//! `apply_value` should nak-retry or count-and-move-on.

use gw_core::object::{ObjectId, ObjectRecord, ObjectType};
use metrics::histogram;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache transient error: {0}")]
    Transient(String),
    #[error("cache permanent error: {0}")]
    Permanent(String),
}

impl From<RedisError> for CacheError {
    fn from(e: RedisError) -> Self {
        match e.kind() {
            ErrorKind::IoError | ErrorKind::TryAgain | ErrorKind::MasterDown | ErrorKind::ClusterDown => {
                CacheError::Transient(e.to_string())
            }
            _ if e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() => {
                CacheError::Transient(e.to_string())
            }
            _ => CacheError::Permanent(e.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: i64,
    pub key_prefix: String,
    pub connection_timeout_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 6379,
            password: None,
            database: 0,
            key_prefix: "bacnet:".to_owned(),
            connection_timeout_ms: 2_000,
            command_timeout_ms: 1_000,
        }
    }
}

const ITERATE_CHUNK: usize = 200;

pub struct CacheMirror {
    conn: ConnectionManager,
    prefix: String,
}

impl CacheMirror {
    pub async fn connect(cfg: &CacheConfig) -> Result<Self, CacheError> {
        let auth = match &cfg.password {
            Some(p) => format!(":{p}@"),
            None => String::new(),
        };
        let url = format!("redis://{auth}{}:{}/{}", cfg.host, cfg.port, cfg.database);
        let client = redis::Client::open(url).map_err(CacheError::from)?;
        let conn = client.get_connection_manager().await.map_err(CacheError::from)?;
        Ok(Self {
            conn,
            prefix: cfg.key_prefix.clone(),
        })
    }

    fn object_key(&self, id: ObjectId) -> String {
        format!("{}object:{}", self.prefix, id.cache_suffix())
    }

    fn index_key(&self) -> String {
        format!("{}objects:index", self.prefix)
    }

    fn positions_key(&self) -> String {
        format!("{}stream:positions", self.prefix)
    }

    fn device_config_key(&self) -> String {
        format!("{}device:config", self.prefix)
    }

    fn change_channel(&self) -> String {
        format!("{}events:value_change", self.prefix)
    }

    /// `SET` the object blob and `SADD` its index entry in one pipelined,
    /// atomic batch (spec.md §4.1: "both writes in a single pipelined
    /// batch; if the backend supports transactions, use one").
    pub async fn put_object(&mut self, record: &ObjectRecord) -> Result<(), CacheError> {
        let blob = serde_json::to_string(record)
            .map_err(|e| CacheError::Permanent(format!("serializing object record: {e}")))?;
        let key = self.object_key(record.id);
        let member = record.id.cache_suffix();
        redis::pipe()
            .atomic()
            .set(&key, blob)
            .sadd(self.index_key(), member)
            .query_async::<()>(&mut self.conn)
            .await
            .map_err(CacheError::from)
    }

    pub async fn get_object(&mut self, id: ObjectId) -> Result<Option<ObjectRecord>, CacheError> {
        let started = Instant::now();
        let key = self.object_key(id);
        let blob: Option<String> = self.conn.get(key).await.map_err(CacheError::from)?;
        histogram!("gateway_read_latency_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        match blob {
            Some(s) => {
                let record = serde_json::from_str(&s)
                    .map_err(|e| CacheError::Permanent(format!("decoding cached object: {e}")))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub async fn delete_object(&mut self, id: ObjectId) -> Result<(), CacheError> {
        let key = self.object_key(id);
        let member = id.cache_suffix();
        redis::pipe()
            .atomic()
            .del(&key)
            .srem(self.index_key(), member)
            .query_async::<()>(&mut self.conn)
            .await
            .map_err(CacheError::from)
    }

    /// Restartable startup scan: `SMEMBERS` the index, then `MGET` blobs in
    /// chunks so one missing/slow key cannot abort the whole recovery. A
    /// member with no backing blob is logged and skipped rather than
    /// surfaced as an error — the index and blobs are only guaranteed
    /// consistent after steady state (spec.md §3 invariant 1).
    pub async fn iterate_objects(&mut self) -> Result<Vec<ObjectRecord>, CacheError> {
        let members: Vec<String> = self.conn.smembers(self.index_key()).await.map_err(CacheError::from)?;
        let mut out = Vec::with_capacity(members.len());
        for chunk in members.chunks(ITERATE_CHUNK) {
            let keys: Vec<String> = chunk
                .iter()
                .filter_map(|m| parse_member(m).map(|id| self.object_key(id)))
                .collect();
            if keys.is_empty() {
                continue;
            }
            let blobs: Vec<Option<String>> = self.conn.mget(&keys).await.map_err(CacheError::from)?;
            for blob in blobs.into_iter().flatten() {
                match serde_json::from_str::<ObjectRecord>(&blob) {
                    Ok(record) => out.push(record),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed cached object during recovery");
                    }
                }
            }
        }
        Ok(out)
    }

    pub async fn put_cursor(&mut self, subscription_id: &str, position: u64) -> Result<(), CacheError> {
        self.conn
            .hset::<_, _, _, ()>(self.positions_key(), subscription_id, position)
            .await
            .map_err(CacheError::from)
    }

    pub async fn get_cursor(&mut self, subscription_id: &str) -> Result<Option<u64>, CacheError> {
        let started = Instant::now();
        let result = self
            .conn
            .hget(self.positions_key(), subscription_id)
            .await
            .map_err(CacheError::from);
        histogram!("gateway_read_latency_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    pub async fn put_device_config_field(&mut self, field: &str, value: &str) -> Result<(), CacheError> {
        self.conn
            .hset::<_, _, _, ()>(self.device_config_key(), field, value)
            .await
            .map_err(CacheError::from)
    }

    /// Best-effort out-of-band change signal; failures are swallowed by the
    /// caller per spec.md §4.1, so this returns the classified error rather
    /// than panicking and lets the supervisor decide whether to count it.
    pub async fn publish_change(&mut self, id: ObjectId) -> Result<(), CacheError> {
        let _: i64 = self
            .conn
            .publish(self.change_channel(), id.cache_suffix())
            .await
            .map_err(CacheError::from)?;
        Ok(())
    }
}

fn parse_member(member: &str) -> Option<ObjectId> {
    let (type_part, instance_part) = member.split_once(':')?;
    let object_type = ObjectType::try_from(type_part.parse::<u8>().ok()?).ok()?;
    let object_instance = instance_part.parse::<u32>().ok()?;
    Some(ObjectId::new(object_type, object_instance))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_member_round_trips_cache_suffix() {
        let id = ObjectId::new(ObjectType::AnalogInput, 42);
        let parsed = parse_member(&id.cache_suffix()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_member_rejects_garbage() {
        assert!(parse_member("not-a-member").is_none());
        assert!(parse_member("99:5").is_none());
    }

    #[test]
    fn transient_vs_permanent_error_classification() {
        let io_err = RedisError::from((ErrorKind::IoError, "connection reset"));
        assert!(matches!(CacheError::from(io_err), CacheError::Transient(_)));
        let type_err = RedisError::from((ErrorKind::TypeError, "unexpected reply"));
        assert!(matches!(CacheError::from(type_err), CacheError::Permanent(_)));
    }
}
