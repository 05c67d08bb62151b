
use crate::config::RedisConfig;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Thin wrapper over a multiplexed Redis connection. All callers apply their
/// own deadlines with `tokio::time::timeout`; the wrapper only hides the
/// connection cloning and arg plumbing.
#[derive(Clone)]
pub struct RedisHandle {
    con: MultiplexedConnection,
}

pub async fn connect(cfg: &RedisConfig) -> anyhow::Result<RedisHandle> {
    let url = if cfg.password.is_empty() {
        format!("redis://{}/{}", cfg.address, cfg.db)
    } else {
        format!("redis://:{}@{}/{}", cfg.password, cfg.address, cfg.db)
    };
    let client = redis::Client::open(url)?;
    let mut con = tokio::time::timeout(CONNECT_TIMEOUT, client.get_multiplexed_tokio_connection())
        .await
        .map_err(|_| anyhow::anyhow!("redis connect timeout ({})", cfg.address))??;

    // Verify the connection up front so a bad address fails at startup.
    let pong: String = redis::cmd("PING").query_async(&mut con).await?;
    if pong != "PONG" {
        anyhow::bail!("unexpected PING reply from redis: {pong}");
    }
    Ok(RedisHandle { con })
}

impl RedisHandle {
    pub fn connection(&self) -> MultiplexedConnection {
        self.con.clone()
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut con = self.con.clone();
        Ok(con.get(key).await?)
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let mut con = self.con.clone();
        let _: () = con.set(key, value).await?;
        Ok(())
    }

    pub async fn set_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> anyhow::Result<()> {
        let mut con = self.con.clone();
        let _: () = con.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> anyhow::Result<()> {
        let mut con = self.con.clone();
        let _: () = con.del(key).await?;
        Ok(())
    }

    pub async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let mut con = self.con.clone();
        let _: () = con.sadd(key, member).await?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let mut con = self.con.clone();
        let _: () = con.srem(key, member).await?;
        Ok(())
    }

    pub async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let mut con = self.con.clone();
        Ok(con.smembers(key).await?)
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        let mut con = self.con.clone();
        let pong: String = redis::cmd("PING").query_async(&mut con).await?;
        if pong != "PONG" {
            anyhow::bail!("unexpected PING reply: {pong}");
        }
        Ok(())
    }
}
