use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Pipeline, Script, Value};
use url::Url;

use super::{KvStore, SeriesSpec, SessionClaim, StoreCommand, StoreError, StoreResult};
use crate::aggregator::Aggregation;
use crate::types::DataPoint;

const CLAIM_SESSION_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
local created = 0
if not current then
  current = ARGV[1]
  created = 1
end
redis.call('SET', KEYS[1], current, 'PX', ARGV[2])
return {current, created}
";

const RELEASE_SESSION_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
";

const MEAN_FIELD_SCRIPT: &str = r"
local count = tonumber(redis.call('HGET', KEYS[1], ARGV[2]) or '0') or 0
if count <= 0 then
  return 0
end
local sum = 0
for i = 3, #ARGV do
  sum = sum + (tonumber(redis.call('HGET', KEYS[1], ARGV[i]) or '0') or 0)
end
redis.call('HSET', KEYS[1], ARGV[1], tostring(sum / count))
return 1
";

const SCAN_BATCH: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:6379".to_string(),
            password: None,
            db: 0,
        }
    }
}

impl RedisConfig {
    pub fn connection_url(&self) -> StoreResult<Url> {
        let mut url = Url::parse(&format!("redis://{}/{}", self.addr, self.db))
            .map_err(|error| StoreError::Address(format!("{}: {}", self.addr, error)))?;
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            url.set_password(Some(password))
                .map_err(|_| StoreError::Address(self.addr.clone()))?;
        }
        Ok(url)
    }
}

/// Redis (with the RedisTimeSeries module) behind the [`KvStore`] seam.
pub struct RedisStore {
    conn: ConnectionManager,
    claim_script: Script,
    release_script: Script,
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        let url = config.connection_url()?;
        let client = redis::Client::open(url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        log::info!("Connected to redis at {} (db {})", config.addr, config.db);

        Ok(Self {
            conn,
            claim_script: Script::new(CLAIM_SESSION_SCRIPT),
            release_script: Script::new(RELEASE_SESSION_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn queue(pipe: &mut Pipeline, command: &StoreCommand) {
    match command {
        StoreCommand::HSet { key, fields } => {
            let cmd = pipe.cmd("HSET").arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            cmd.ignore();
        }
        StoreCommand::HSetNx { key, field, value } => {
            pipe.cmd("HSETNX").arg(key).arg(field).arg(value).ignore();
        }
        StoreCommand::HIncrBy { key, field, delta } => {
            pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta).ignore();
        }
        StoreCommand::HIncrByFloat { key, field, delta } => {
            pipe.cmd("HINCRBYFLOAT")
                .arg(key)
                .arg(field)
                .arg(*delta)
                .ignore();
        }
        StoreCommand::SAdd { key, member } => {
            pipe.cmd("SADD").arg(key).arg(member).ignore();
        }
        StoreCommand::ZAdd { key, member, score } => {
            pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
        }
        StoreCommand::HSetMean {
            key,
            field,
            sum_fields,
            count_field,
        } => {
            // EVAL runs inside MULTI, after the increments queued before it.
            let cmd = pipe
                .cmd("EVAL")
                .arg(MEAN_FIELD_SCRIPT)
                .arg(1)
                .arg(key)
                .arg(field)
                .arg(count_field);
            for name in sum_fields {
                cmd.arg(name);
            }
            cmd.ignore();
        }
        StoreCommand::IncrBy { key, delta } => {
            pipe.cmd("INCRBY").arg(key).arg(*delta).ignore();
        }
        StoreCommand::SetWithTtl { key, value, ttl } => {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .ignore();
        }
        StoreCommand::Expire { key, ttl } => {
            pipe.cmd("PEXPIRE")
                .arg(key)
                .arg(ttl.as_millis() as u64)
                .ignore();
        }
    }
}

/// Maps the module's "key does not exist" reply onto [`StoreError::NotFound`].
fn series_error(key: &str, error: redis::RedisError) -> StoreError {
    if error.to_string().contains("does not exist") {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Redis(error)
    }
}

fn reply_integer(value: &Value) -> StoreResult<i64> {
    match value {
        Value::Int(number) => Ok(*number),
        Value::BulkString(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| StoreError::InvalidReply(format!("{:?}", value))),
        Value::SimpleString(text) => text
            .parse()
            .map_err(|_| StoreError::InvalidReply(text.clone())),
        other => Err(StoreError::InvalidReply(format!("{:?}", other))),
    }
}

fn reply_float(value: &Value) -> StoreResult<f64> {
    match value {
        Value::Double(number) => Ok(*number),
        Value::Int(number) => Ok(*number as f64),
        Value::BulkString(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| StoreError::InvalidReply(format!("{:?}", value))),
        Value::SimpleString(text) => text
            .parse()
            .map_err(|_| StoreError::InvalidReply(text.clone())),
        other => Err(StoreError::InvalidReply(format!("{:?}", other))),
    }
}

fn reply_sample(value: &Value) -> StoreResult<DataPoint> {
    match value {
        Value::Array(items) if items.len() == 2 => Ok(DataPoint {
            timestamp: reply_integer(&items[0])?,
            value: reply_float(&items[1])?,
        }),
        other => Err(StoreError::InvalidReply(format!("{:?}", other))),
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn exec_atomic(&self, commands: Vec<StoreCommand>) -> StoreResult<()> {
        if commands.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in &commands {
            queue(&mut pipe, command);
        }

        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?)
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("SCARD").arg(key).query_async(&mut conn).await?)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?)
    }

    async fn zrange_with_scores(&self, key: &str) -> StoreResult<Vec<(String, f64)>> {
        let mut conn = self.conn();
        Ok(redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?)
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn claim_session(
        &self,
        index_key: &str,
        candidate: &str,
        idle_ttl: Duration,
    ) -> StoreResult<SessionClaim> {
        let mut conn = self.conn();
        let (session_id, created): (String, i64) = self
            .claim_script
            .key(index_key)
            .arg(candidate)
            .arg(idle_ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        Ok(SessionClaim {
            session_id,
            created: created == 1,
        })
    }

    async fn release_session(&self, index_key: &str, session_id: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = self
            .release_script
            .key(index_key)
            .arg(session_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn ts_create(&self, spec: &SeriesSpec) -> StoreResult<()> {
        let mut cmd = redis::cmd("TS.CREATE");
        cmd.arg(&spec.key)
            .arg("RETENTION")
            .arg(spec.retention.as_millis() as u64)
            .arg("DUPLICATE_POLICY")
            .arg("LAST");
        if !spec.labels.is_empty() {
            cmd.arg("LABELS");
            for (name, value) in &spec.labels {
                cmd.arg(name).arg(value);
            }
        }

        let mut conn = self.conn();
        let result: redis::RedisResult<()> = cmd.query_async(&mut conn).await;
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.to_string().contains("already exists") => {
                Err(StoreError::AlreadyExists(spec.key.clone()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn ts_add(&self, key: &str, timestamp_ms: i64, value: f64) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("TS.ADD")
            .arg(key)
            .arg(timestamp_ms)
            .arg(value)
            .arg("ON_DUPLICATE")
            .arg("LAST")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ts_range(
        &self,
        key: &str,
        start_ms: i64,
        end_ms: i64,
        aggregation: Option<(Aggregation, i64)>,
    ) -> StoreResult<Vec<DataPoint>> {
        let mut cmd = redis::cmd("TS.RANGE");
        cmd.arg(key).arg(start_ms).arg(end_ms);
        if let Some((aggregation, bucket_ms)) = aggregation.filter(|(_, bucket)| *bucket > 0) {
            cmd.arg("AGGREGATION").arg(aggregation.as_str()).arg(bucket_ms);
        }

        let mut conn = self.conn();
        let reply: Vec<Value> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|error| series_error(key, error))?;
        reply.iter().map(reply_sample).collect()
    }

    async fn ts_get(&self, key: &str) -> StoreResult<Option<DataPoint>> {
        let mut conn = self.conn();
        let reply: Value = redis::cmd("TS.GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|error| series_error(key, error))?;

        match &reply {
            Value::Nil => Ok(None),
            Value::Array(items) if items.is_empty() => Ok(None),
            _ => reply_sample(&reply).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RedisConfig;

    #[test]
    fn connection_url_carries_database_and_password() {
        let config = RedisConfig {
            addr: "cache.internal:6380".to_string(),
            password: Some("s3cret".to_string()),
            db: 2,
        };
        let url = config.connection_url().expect("url");
        assert_eq!(url.as_str(), "redis://:s3cret@cache.internal:6380/2");
    }

    #[test]
    fn empty_password_is_ignored() {
        let config = RedisConfig {
            password: Some(String::new()),
            ..RedisConfig::default()
        };
        let url = config.connection_url().expect("url");
        assert_eq!(url.as_str(), "redis://localhost:6379/0");
    }
}
