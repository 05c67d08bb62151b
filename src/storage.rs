
use crate::store::RedisHandle;
use ahash::AHashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_LIST_LIMIT: usize = 100;
const STATS_SCAN_LIMIT: usize = 10_000;

/// Persisted request log entry (`log:<id>`), indexed through sorted sets
/// scored by Unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: String,
    pub ts_ms: u64,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,
    pub status: u16,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilters {
    pub user_id: Option<String>,
    pub model: Option<String>,
    pub status: Option<u16>,
    /// Unix seconds, inclusive.
    pub from_secs: Option<u64>,
    pub to_secs: Option<u64>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct UsageStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub by_model: AHashMap<String, u64>,
    pub by_status: AHashMap<u16, u64>,
    pub avg_duration_ms: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct CostStats {
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub by_model: AHashMap<String, f64>,
}

/// Persistent request-log capability. `Null` swallows writes so the pipeline
/// never branches on whether logging is wired up.
#[derive(Clone)]
pub enum LogStore {
    Redis(RedisLogStore),
    Null,
}

impl LogStore {
    pub fn redis(handle: RedisHandle, retention: Duration) -> Self {
        LogStore::Redis(RedisLogStore { redis: handle, retention })
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, LogStore::Null)
    }

    pub async fn save(&self, entry: &RequestLog) -> anyhow::Result<()> {
        match self {
            LogStore::Redis(store) => store.save(entry).await,
            LogStore::Null => Ok(()),
        }
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<RequestLog>> {
        match self {
            LogStore::Redis(store) => store.get(id).await,
            LogStore::Null => Ok(None),
        }
    }

    pub async fn list(&self, filters: &LogFilters) -> anyhow::Result<Vec<RequestLog>> {
        match self {
            LogStore::Redis(store) => store.list(filters).await,
            LogStore::Null => Ok(Vec::new()),
        }
    }

    pub async fn usage_stats(
        &self,
        user_id: Option<&str>,
        from_secs: Option<u64>,
        to_secs: Option<u64>,
    ) -> anyhow::Result<UsageStats> {
        let logs = self.stats_window(user_id, from_secs, to_secs).await?;
        let mut stats = UsageStats::default();
        let mut total_duration_ms = 0u64;
        for log in &logs {
            stats.total_requests += 1;
            if log.cache_hit {
                stats.cache_hits += 1;
            } else {
                stats.cache_misses += 1;
            }
            if let Some(model) = &log.model {
                *stats.by_model.entry(model.clone()).or_default() += 1;
            }
            *stats.by_status.entry(log.status).or_default() += 1;
            total_duration_ms += log.duration_ms;
        }
        if stats.total_requests > 0 {
            stats.avg_duration_ms = total_duration_ms / stats.total_requests;
        }
        Ok(stats)
    }

    pub async fn cost_stats(
        &self,
        user_id: Option<&str>,
        from_secs: Option<u64>,
        to_secs: Option<u64>,
    ) -> anyhow::Result<CostStats> {
        let logs = self.stats_window(user_id, from_secs, to_secs).await?;
        let mut stats = CostStats::default();
        for log in &logs {
            let cost = log.cost_usd.unwrap_or(0.0);
            stats.total_cost_usd += cost;
            stats.total_tokens += log.tokens_used.unwrap_or(0) as u64;
            if let Some(model) = &log.model {
                *stats.by_model.entry(model.clone()).or_default() += cost;
            }
        }
        Ok(stats)
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        match self {
            LogStore::Redis(store) => store.redis.ping().await,
            LogStore::Null => Ok(()),
        }
    }

    async fn stats_window(
        &self,
        user_id: Option<&str>,
        from_secs: Option<u64>,
        to_secs: Option<u64>,
    ) -> anyhow::Result<Vec<RequestLog>> {
        self.list(&LogFilters {
            user_id: user_id.map(str::to_string),
            from_secs,
            to_secs,
            limit: STATS_SCAN_LIMIT,
            ..LogFilters::default()
        })
        .await
    }
}

#[derive(Clone)]
pub struct RedisLogStore {
    redis: RedisHandle,
    retention: Duration,
}

impl RedisLogStore {
    async fn save(&self, entry: &RequestLog) -> anyhow::Result<()> {
        let mut con = self.redis.connection();
        let retention_secs = self.retention.as_secs();

        let data = serde_json::to_vec(entry)?;
        let _: () = con
            .set_ex(format!("log:{}", entry.id), data, retention_secs)
            .await?;

        let score = (entry.ts_ms / 1000) as f64;
        let cutoff = now_secs().saturating_sub(retention_secs) as f64;

        self.index(&mut con, "logs:timeline", &entry.id, score, cutoff, retention_secs)
            .await?;
        if !entry.user_id.is_empty() {
            let key = format!("logs:user:{}", entry.user_id);
            self.index(&mut con, &key, &entry.id, score, cutoff, retention_secs)
                .await?;
        }
        if let Some(model) = &entry.model {
            let key = format!("logs:model:{model}");
            self.index(&mut con, &key, &entry.id, score, cutoff, retention_secs)
                .await?;
        }
        Ok(())
    }

    async fn index(
        &self,
        con: &mut redis::aio::MultiplexedConnection,
        key: &str,
        id: &str,
        score: f64,
        cutoff: f64,
        retention_secs: u64,
    ) -> anyhow::Result<()> {
        let _: () = con.zadd(key, id, score).await?;
        let _: () = con.zrembyscore(key, f64::NEG_INFINITY, cutoff).await?;
        let _: () = con.expire(key, retention_secs as i64).await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<RequestLog>> {
        let Some(data) = self.redis.get(&format!("log:{id}")).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    async fn list(&self, filters: &LogFilters) -> anyhow::Result<Vec<RequestLog>> {
        let index_key = if let Some(user_id) = &filters.user_id {
            format!("logs:user:{user_id}")
        } else if let Some(model) = &filters.model {
            format!("logs:model:{model}")
        } else {
            "logs:timeline".to_string()
        };

        let min = filters.from_secs.map(|s| s as f64).unwrap_or(f64::NEG_INFINITY);
        let max = filters.to_secs.map(|s| s as f64).unwrap_or_else(|| now_secs() as f64);
        let limit = if filters.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            filters.limit
        };

        let mut con = self.redis.connection();
        let ids: Vec<String> = con
            .zrevrangebyscore_limit(
                &index_key,
                max,
                min,
                filters.offset as isize,
                limit as isize,
            )
            .await?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(log) = self.get(&id).await? {
                if let Some(status) = filters.status {
                    if log.status != status {
                        continue;
                    }
                }
                out.push(log);
            }
        }
        Ok(out)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
