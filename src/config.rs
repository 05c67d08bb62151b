
use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub loadbalancer: LoadBalancerConfig,

    #[serde(default)]
    pub ratelimit: RateLimitConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub transform: TransformConfig,

    /// USD per 1 000 tokens, keyed by model name.
    #[serde(default)]
    pub models: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Either `host:port` or `:port` (binds all interfaces).
    #[serde(default = "default_port")]
    pub port: String,

    /// Tokio runtime worker threads.
    pub worker_threads: Option<usize>,
}

fn default_port() -> String {
    ":8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            worker_threads: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxyConfig {
    /// Single upstream origin, e.g. https://api.openai.com
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// round-robin | weighted | least-latency | random
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub url: String,
    /// Weighted selection share (clamped to >= 1).
    #[serde(default)]
    pub weight: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "requests_per_second")]
    pub rps: f64,
    #[serde(default)]
    pub burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_address")]
    pub address: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
}

fn default_redis_address() -> String {
    "127.0.0.1:6379".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_redis_address(),
            password: String::new(),
            db: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Gate for /admin/*; empty disables the admin API.
    #[serde(default)]
    pub admin_key: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub retention_days: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TransformConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub remove_headers: Vec<String>,
    #[serde(default)]
    pub add_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub replace_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub request_rules: Vec<TransformRule>,
    #[serde(default)]
    pub response_rules: Vec<TransformRule>,
    #[serde(default)]
    pub mask_sensitive_data: bool,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub blocked_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransformRule {
    #[serde(rename = "type")]
    pub kind: RuleKind,
    /// Dotted JSON path; numeric segments index into arrays (`messages.0.content`).
    pub path: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Add,
    Remove,
    Replace,
    Mask,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.port.trim().is_empty() {
            anyhow::bail!("config: server.port must not be empty");
        }
        self.listen_addr()?;

        if self.loadbalancer.enabled {
            if self.loadbalancer.targets.is_empty() {
                anyhow::bail!("config: loadbalancer.enabled requires at least one target");
            }
            for (i, t) in self.loadbalancer.targets.iter().enumerate() {
                if !(t.url.starts_with("http://") || t.url.starts_with("https://")) {
                    anyhow::bail!(
                        "config: loadbalancer.targets[{i}].url must start with http:// or https://"
                    );
                }
            }
            match self.loadbalancer.strategy.as_str() {
                "" | "round-robin" | "weighted" | "least-latency" | "random" => {}
                other => anyhow::bail!("config: unknown loadbalancer.strategy {other:?}"),
            }
        } else if self.proxy.target.trim().is_empty() {
            anyhow::bail!("config: proxy.target must be set when the load balancer is disabled");
        }

        if self.ratelimit.rps < 0.0 {
            anyhow::bail!("config: ratelimit.requests_per_second must be >= 0");
        }

        if self.auth.enabled && !self.redis.enabled {
            anyhow::bail!("config: auth.enabled requires redis.enabled");
        }

        for pattern in self
            .transform
            .allowed_paths
            .iter()
            .chain(self.transform.blocked_paths.iter())
        {
            regex::Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("config: invalid transform path pattern {pattern:?}: {e}"))?;
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let port = self.server.port.trim();
        let addr = if let Some(stripped) = port.strip_prefix(':') {
            format!("0.0.0.0:{stripped}")
        } else {
            port.to_string()
        };
        addr.parse()
            .map_err(|e| anyhow::anyhow!("config: invalid server.port {port:?}: {e}"))
    }

    /// Log retention for the request-log store. Zero falls back to 30 days.
    pub fn retention(&self) -> std::time::Duration {
        let days = if self.logging.retention_days == 0 {
            30
        } else {
            self.logging.retention_days
        };
        std::time::Duration::from_secs(days * 24 * 60 * 60)
    }
}

/// Hot-reloadable configuration store. The active snapshot is an immutable
/// `Arc<Config>` swapped atomically; readers copy the pointer per request.
pub struct ConfigStore {
    path: PathBuf,
    snapshot: ArcSwap<Config>,
}

impl ConfigStore {
    pub fn load(path: &Path) -> anyhow::Result<Arc<Self>> {
        let cfg = Config::load(path)?;
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            snapshot: ArcSwap::from_pointee(cfg),
        }))
    }

    #[inline]
    pub fn get(&self) -> Arc<Config> {
        self.snapshot.load_full()
    }

    fn reload(&self) {
        match Config::load(&self.path) {
            Ok(cfg) => {
                self.snapshot.store(Arc::new(cfg));
                tracing::info!(path = %self.path.display(), "configuration reloaded");
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "config reload failed; keeping previous snapshot"
                );
            }
        }
    }

    /// Watches the config file's directory and republishes the snapshot on
    /// change. The watcher lives on its own thread for the process lifetime.
    pub fn watch(self: &Arc<Self>) -> anyhow::Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let (tx, rx) = std::sync::mpsc::channel::<notify::Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => tracing::warn!(error = %e, "config watcher error"),
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let store = self.clone();
        std::thread::Builder::new()
            .name("config-watcher".to_string())
            .spawn(move || {
                // Keep the watcher alive for the thread lifetime.
                let _watcher = watcher;
                while let Ok(event) = rx.recv() {
                    let relevant = matches!(
                        event.kind,
                        notify::EventKind::Create(_)
                            | notify::EventKind::Modify(_)
                            | notify::EventKind::Remove(_)
                    ) && event.paths.iter().any(|p| {
                        match (&file_name, p.file_name()) {
                            (Some(want), Some(got)) => want == got,
                            _ => true,
                        }
                    });
                    if relevant {
                        store.reload();
                    }
                }
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
server:
  port: ":8080"
proxy:
  target: "https://api.openai.com"
loadbalancer:
  enabled: true
  strategy: weighted
  targets:
    - url: "http://backend-a:9000"
      weight: 3
    - url: "http://backend-b:9000"
      weight: 1
ratelimit:
  enabled: true
  requests_per_second: 2.5
  burst: 4
redis:
  enabled: true
  address: "127.0.0.1:6379"
  db: 2
auth:
  enabled: true
  admin_key: "super-secret"
logging:
  enabled: true
  retention_days: 7
transform:
  enabled: true
  remove_headers: ["x-debug"]
  add_headers:
    x-env: prod
  request_rules:
    - type: mask
      path: messages.0.content
    - type: add
      path: metadata.source
      value: relay
  mask_sensitive_data: true
  allowed_paths: ["^/v1/.*"]
models:
  gpt-4: 0.03
  gpt-3.5-turbo: 0.0005
"#;

    #[test]
    fn parses_full_surface() {
        let cfg: Config = serde_yaml::from_str(FULL).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.server.port, ":8080");
        assert_eq!(cfg.loadbalancer.targets.len(), 2);
        assert_eq!(cfg.loadbalancer.targets[0].weight, 3);
        assert_eq!(cfg.ratelimit.rps, 2.5);
        assert_eq!(cfg.ratelimit.burst, 4);
        assert_eq!(cfg.redis.db, 2);
        assert_eq!(cfg.auth.admin_key, "super-secret");
        assert_eq!(cfg.models["gpt-4"], 0.03);

        let rules = &cfg.transform.request_rules;
        assert_eq!(rules[0].kind, RuleKind::Mask);
        assert_eq!(rules[0].path, "messages.0.content");
        assert_eq!(rules[1].kind, RuleKind::Add);
        assert_eq!(rules[1].value, Some(serde_json::json!("relay")));
    }

    #[test]
    fn listen_addr_accepts_bare_port() {
        let cfg: Config = serde_yaml::from_str("server:\n  port: \":9000\"\nproxy:\n  target: \"http://u\"\n").unwrap();
        assert_eq!(cfg.listen_addr().unwrap().port(), 9000);
    }

    #[test]
    fn lb_requires_targets() {
        let cfg: Config =
            serde_yaml::from_str("loadbalancer:\n  enabled: true\n  targets: []\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn auth_requires_redis() {
        let cfg: Config = serde_yaml::from_str(
            "proxy:\n  target: \"http://u\"\nauth:\n  enabled: true\n",
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_path_pattern_is_rejected() {
        let cfg: Config = serde_yaml::from_str(
            "proxy:\n  target: \"http://u\"\ntransform:\n  blocked_paths: [\"([\"]\n",
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let cfg: Config = serde_yaml::from_str(
            "loadbalancer:\n  enabled: true\n  strategy: fastest\n  targets:\n    - url: \"http://a\"\n",
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retention_defaults_to_thirty_days() {
        let cfg = Config::default();
        assert_eq!(cfg.retention(), std::time::Duration::from_secs(30 * 86400));
    }
}
