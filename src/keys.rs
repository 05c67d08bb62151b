
use crate::auth::{record_key, ApiKey, KEY_PREFIX};
use crate::store::RedisHandle;
use crate::util::now_ms;
use rand::distr::Alphanumeric;
use rand::Rng;

const KEY_SECRET_LEN: usize = 43;

fn user_keys_key(user_id: &str) -> String {
    format!("user:{user_id}:keys")
}

#[derive(Debug, Clone, Default)]
pub struct CreateKeyParams {
    pub name: String,
    pub user_id: String,
    pub description: String,
    pub rate_limit: f64,
    pub burst: u32,
    pub quota: i64,
    pub expires_in_secs: Option<u64>,
}

/// Credential management over the shared store: `apikey:<key>` holds the
/// record, `user:<id>:keys` indexes a user's keys.
#[derive(Clone)]
pub struct KeyManager {
    redis: RedisHandle,
}

impl KeyManager {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis }
    }

    pub async fn create(&self, params: CreateKeyParams) -> anyhow::Result<ApiKey> {
        let now = now_ms();
        let api_key = ApiKey {
            key: generate_key(),
            name: params.name,
            user_id: params.user_id,
            rate_limit: params.rate_limit,
            burst: params.burst,
            quota: params.quota,
            used: 0,
            active: true,
            created_at_ms: now,
            expires_at_ms: params.expires_in_secs.map(|secs| now + secs * 1000),
            last_used_at_ms: None,
            description: params.description,
        };
        self.save(&api_key).await?;
        if !api_key.user_id.is_empty() {
            self.redis
                .sadd(&user_keys_key(&api_key.user_id), &api_key.key)
                .await?;
        }
        Ok(api_key)
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<ApiKey>> {
        let Some(data) = self.redis.get(&record_key(key)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    pub async fn list(&self, user_id: &str) -> anyhow::Result<Vec<ApiKey>> {
        let members = self.redis.smembers(&user_keys_key(user_id)).await?;
        let mut out = Vec::with_capacity(members.len());
        for key in members {
            if let Some(api_key) = self.get(&key).await? {
                out.push(api_key);
            }
        }
        out.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        Ok(out)
    }

    /// Marks a key inactive; the record stays for auditability.
    pub async fn revoke(&self, key: &str) -> anyhow::Result<bool> {
        let Some(mut api_key) = self.get(key).await? else {
            return Ok(false);
        };
        api_key.active = false;
        self.save(&api_key).await?;
        Ok(true)
    }

    /// Issues a fresh secret carrying over the record's metadata and usage.
    /// The old secret stops working immediately.
    pub async fn rotate(&self, key: &str) -> anyhow::Result<Option<ApiKey>> {
        let Some(mut api_key) = self.get(key).await? else {
            return Ok(None);
        };
        let old_key = api_key.key.clone();
        api_key.key = generate_key();
        self.save(&api_key).await?;
        self.redis.del(&record_key(&old_key)).await?;
        if !api_key.user_id.is_empty() {
            let index = user_keys_key(&api_key.user_id);
            self.redis.srem(&index, &old_key).await?;
            self.redis.sadd(&index, &api_key.key).await?;
        }
        Ok(Some(api_key))
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let Some(api_key) = self.get(key).await? else {
            return Ok(false);
        };
        self.redis.del(&record_key(key)).await?;
        if !api_key.user_id.is_empty() {
            self.redis
                .srem(&user_keys_key(&api_key.user_id), key)
                .await?;
        }
        Ok(true)
    }

    async fn save(&self, api_key: &ApiKey) -> anyhow::Result<()> {
        let data = serde_json::to_vec(api_key)?;
        self.redis.set(&record_key(&api_key.key), &data).await
    }
}

fn generate_key() -> String {
    let mut rng = rand::rng();
    let secret: String = (0..KEY_SECRET_LEN)
        .map(|_| char::from(rng.sample(Alphanumeric)))
        .collect();
    format!("{KEY_PREFIX}{secret}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_carry_the_prefix_and_length() {
        let key = generate_key();
        assert!(key.starts_with(KEY_PREFIX));
        assert_eq!(key.len(), KEY_PREFIX.len() + KEY_SECRET_LEN);
    }

    #[test]
    fn generated_keys_are_unique() {
        assert_ne!(generate_key(), generate_key());
    }

    #[test]
    fn store_key_layout() {
        assert_eq!(record_key("relay_abc"), "apikey:relay_abc");
        assert_eq!(user_keys_key("u1"), "user:u1:keys");
    }
}
