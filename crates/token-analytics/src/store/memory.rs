use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{KvStore, SeriesSpec, SessionClaim, StoreCommand, StoreError, StoreResult};
use crate::aggregator::{aggregate_buckets, Aggregation};
use crate::clock::{Clock, SystemClock};
use crate::types::DataPoint;

/// In-process store with the same semantics the engine relies on from Redis:
/// lazy key expiry, atomic batches and retention-bound time series.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Hash,
    Set,
    SortedSet,
}

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    SortedSet(HashMap<String, f64>),
}

impl Value {
    fn empty(kind: Kind) -> Self {
        match kind {
            Kind::Text => Self::Text(String::new()),
            Kind::Hash => Self::Hash(HashMap::new()),
            Kind::Set => Self::Set(BTreeSet::new()),
            Kind::SortedSet => Self::SortedSet(HashMap::new()),
        }
    }

    fn kind(&self) -> Kind {
        match self {
            Self::Text(_) => Kind::Text,
            Self::Hash(_) => Kind::Hash,
            Self::Set(_) => Kind::Set,
            Self::SortedSet(_) => Kind::SortedSet,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Series {
    retention_ms: i64,
    samples: BTreeMap<i64, f64>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    series: HashMap<String, Series>,
}

impl State {
    fn purge_if_expired(&mut self, key: &str, now: DateTime<Utc>) {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str, now: DateTime<Utc>) -> Option<&Entry> {
        self.purge_if_expired(key, now);
        self.entries.get(key)
    }

    fn value_of_kind(&mut self, key: &str, kind: Kind, now: DateTime<Utc>) -> StoreResult<&mut Value> {
        self.purge_if_expired(key, now);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::empty(kind),
            expires_at: None,
        });
        if entry.value.kind() != kind {
            return Err(StoreError::WrongType(key.to_string()));
        }
        Ok(&mut entry.value)
    }

    fn apply(&mut self, command: StoreCommand, now: DateTime<Utc>) -> StoreResult<()> {
        match command {
            StoreCommand::HSet { key, fields } => {
                if let Value::Hash(hash) = self.value_of_kind(&key, Kind::Hash, now)? {
                    hash.extend(fields);
                }
            }
            StoreCommand::HSetNx { key, field, value } => {
                if let Value::Hash(hash) = self.value_of_kind(&key, Kind::Hash, now)? {
                    hash.entry(field).or_insert(value);
                }
            }
            StoreCommand::HIncrBy { key, field, delta } => {
                if let Value::Hash(hash) = self.value_of_kind(&key, Kind::Hash, now)? {
                    let current = parse_integer(hash.get(&field), &key)?;
                    let next = current
                        .checked_add(delta)
                        .ok_or_else(|| StoreError::Overflow(key.clone()))?;
                    hash.insert(field, next.to_string());
                }
            }
            StoreCommand::HIncrByFloat { key, field, delta } => {
                if let Value::Hash(hash) = self.value_of_kind(&key, Kind::Hash, now)? {
                    let current = parse_float(hash.get(&field), &key)?;
                    hash.insert(field, (current + delta).to_string());
                }
            }
            StoreCommand::SAdd { key, member } => {
                if let Value::Set(set) = self.value_of_kind(&key, Kind::Set, now)? {
                    set.insert(member);
                }
            }
            StoreCommand::ZAdd { key, member, score } => {
                if let Value::SortedSet(set) = self.value_of_kind(&key, Kind::SortedSet, now)? {
                    set.insert(member, score);
                }
            }
            StoreCommand::HSetMean {
                key,
                field,
                sum_fields,
                count_field,
            } => {
                if let Value::Hash(hash) = self.value_of_kind(&key, Kind::Hash, now)? {
                    let count = parse_float(hash.get(&count_field), &key)?;
                    if count > 0.0 {
                        let mut sum = 0.0;
                        for name in &sum_fields {
                            sum += parse_float(hash.get(name), &key)?;
                        }
                        hash.insert(field, (sum / count).to_string());
                    }
                }
            }
            StoreCommand::IncrBy { key, delta } => {
                let fresh = self.live(&key, now).is_none();
                if let Value::Text(text) = self.value_of_kind(&key, Kind::Text, now)? {
                    let current = if fresh {
                        0
                    } else {
                        text.parse::<i64>().map_err(|_| not_numeric(&key))?
                    };
                    let next = current
                        .checked_add(delta)
                        .ok_or_else(|| StoreError::Overflow(key.clone()))?;
                    *text = next.to_string();
                }
            }
            StoreCommand::SetWithTtl { key, value, ttl } => {
                self.entries.insert(
                    key,
                    Entry {
                        value: Value::Text(value),
                        expires_at: Some(expiry(now, ttl)),
                    },
                );
            }
            StoreCommand::Expire { key, ttl } => {
                self.purge_if_expired(&key, now);
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.expires_at = Some(expiry(now, ttl));
                }
            }
        }
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn exec_atomic(&self, commands: Vec<StoreCommand>) -> StoreResult<()> {
        let now = self.now();
        let mut state = self.state.lock();

        let mut touched: Vec<String> = commands.iter().map(|c| c.key().to_string()).collect();
        touched.sort();
        touched.dedup();
        let backup: Vec<(String, Option<Entry>)> = touched
            .into_iter()
            .map(|key| {
                let previous = state.entries.get(&key).cloned();
                (key, previous)
            })
            .collect();

        for command in commands {
            if let Err(error) = state.apply(command, now) {
                for (key, previous) in backup {
                    match previous {
                        Some(entry) => {
                            state.entries.insert(key, entry);
                        }
                        None => {
                            state.entries.remove(&key);
                        }
                    }
                }
                return Err(error);
            }
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.now();
        let mut state = self.state.lock();
        match state.live(key, now).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let now = self.now();
        let mut state = self.state.lock();
        match state.live(key, now).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let now = self.now();
        let mut state = self.state.lock();
        match state.live(key, now).map(|entry| &entry.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        Ok(self.smembers(key).await?.len() as u64)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let now = self.now();
        let mut state = self.state.lock();
        match state.live(key, now).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn zrange_with_scores(&self, key: &str) -> StoreResult<Vec<(String, f64)>> {
        let now = self.now();
        let mut state = self.state.lock();
        match state.live(key, now).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(Value::SortedSet(set)) => {
                let mut members: Vec<(String, f64)> =
                    set.iter().map(|(m, s)| (m.clone(), *s)).collect();
                members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(members)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let matcher =
            glob::Pattern::new(pattern).map_err(|error| StoreError::Pattern(error.to_string()))?;
        let now = self.now();
        let mut state = self.state.lock();
        state
            .entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));

        Ok(state
            .entries
            .keys()
            .chain(state.series.keys())
            .filter(|key| matcher.matches(key))
            .cloned()
            .collect())
    }

    async fn claim_session(
        &self,
        index_key: &str,
        candidate: &str,
        idle_ttl: Duration,
    ) -> StoreResult<SessionClaim> {
        let now = self.now();
        let mut state = self.state.lock();

        let existing = match state.live(index_key, now).map(|entry| &entry.value) {
            None => None,
            Some(Value::Text(session_id)) => Some(session_id.clone()),
            Some(_) => return Err(StoreError::WrongType(index_key.to_string())),
        };
        let claim = match existing {
            Some(session_id) => SessionClaim {
                session_id,
                created: false,
            },
            None => SessionClaim {
                session_id: candidate.to_string(),
                created: true,
            },
        };

        state.entries.insert(
            index_key.to_string(),
            Entry {
                value: Value::Text(claim.session_id.clone()),
                expires_at: Some(expiry(now, idle_ttl)),
            },
        );
        Ok(claim)
    }

    async fn release_session(&self, index_key: &str, session_id: &str) -> StoreResult<bool> {
        let now = self.now();
        let mut state = self.state.lock();
        let bound = matches!(
            state.live(index_key, now).map(|entry| &entry.value),
            Some(Value::Text(current)) if current == session_id
        );
        if bound {
            state.entries.remove(index_key);
        }
        Ok(bound)
    }

    async fn ts_create(&self, spec: &SeriesSpec) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.series.contains_key(&spec.key) {
            return Err(StoreError::AlreadyExists(spec.key.clone()));
        }
        state.series.insert(
            spec.key.clone(),
            Series {
                retention_ms: spec.retention.as_millis() as i64,
                samples: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn ts_add(&self, key: &str, timestamp_ms: i64, value: f64) -> StoreResult<()> {
        let mut state = self.state.lock();
        let series = state.series.entry(key.to_string()).or_default();
        series.samples.insert(timestamp_ms, value);

        if series.retention_ms > 0 {
            if let Some(newest) = series.samples.keys().next_back().copied() {
                let cutoff = newest - series.retention_ms;
                series.samples = series.samples.split_off(&cutoff);
            }
        }
        Ok(())
    }

    async fn ts_range(
        &self,
        key: &str,
        start_ms: i64,
        end_ms: i64,
        aggregation: Option<(Aggregation, i64)>,
    ) -> StoreResult<Vec<DataPoint>> {
        let state = self.state.lock();
        let series = state
            .series
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if start_ms > end_ms {
            return Ok(Vec::new());
        }

        let samples: Vec<DataPoint> = series
            .samples
            .range(start_ms..=end_ms)
            .map(|(timestamp, value)| DataPoint {
                timestamp: *timestamp,
                value: *value,
            })
            .collect();

        Ok(match aggregation {
            Some((aggregation, bucket_ms)) if bucket_ms > 0 => {
                aggregate_buckets(&samples, aggregation, bucket_ms)
            }
            _ => samples,
        })
    }

    async fn ts_get(&self, key: &str) -> StoreResult<Option<DataPoint>> {
        let state = self.state.lock();
        let series = state
            .series
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        Ok(series
            .samples
            .iter()
            .next_back()
            .map(|(timestamp, value)| DataPoint {
                timestamp: *timestamp,
                value: *value,
            }))
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(ttl.as_millis() as i64)
}

fn parse_integer(raw: Option<&String>, key: &str) -> StoreResult<i64> {
    match raw {
        Some(raw) => raw.parse::<i64>().map_err(|_| not_numeric(key)),
        None => Ok(0),
    }
}

fn parse_float(raw: Option<&String>, key: &str) -> StoreResult<f64> {
    match raw {
        Some(raw) => raw.parse::<f64>().map_err(|_| not_numeric(key)),
        None => Ok(0.0),
    }
}

fn not_numeric(key: &str) -> StoreError {
    StoreError::InvalidReply(format!("value at {} is not a number", key))
}
