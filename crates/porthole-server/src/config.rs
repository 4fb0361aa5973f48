use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_addr: SocketAddr,
    pub db_path: Option<PathBuf>,
    pub upstream_url: String,
    /// Timeout passed to the upstream long-poll.
    pub poll_timeout: Duration,
    /// How long a sliding-sync request may wait for new data.
    pub long_poll_timeout: Duration,
    /// Connections idle for longer than this are evicted.
    pub conn_idle_evict: Duration,
    /// Interval between unreferenced-snapshot sweeps.
    pub snapshot_gc_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8008).into(),
            db_path: None,
            upstream_url: "http://localhost:8080".to_string(),
            poll_timeout: Duration::from_secs(30),
            long_poll_timeout: Duration::from_secs(30),
            conn_idle_evict: Duration::from_secs(30 * 60),
            snapshot_gc_interval: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Ok(url) = std::env::var("UPSTREAM_URL") {
            config.upstream_url = url.trim_end_matches('/').to_string();
        }

        if let Some(secs) = secs_from_env("POLL_TIMEOUT_SECS") {
            config.poll_timeout = secs;
        }
        if let Some(secs) = secs_from_env("LONG_POLL_TIMEOUT_SECS") {
            config.long_poll_timeout = secs;
        }
        if let Some(secs) = secs_from_env("CONN_IDLE_EVICT_SECS") {
            config.conn_idle_evict = secs;
        }
        if let Some(secs) = secs_from_env("SNAPSHOT_GC_SECS") {
            config.snapshot_gc_interval = secs;
        }

        config
    }
}

fn secs_from_env(key: &str) -> Option<Duration> {
    let val = std::env::var(key).ok()?;
    match val.parse::<u64>() {
        Ok(n) => Some(Duration::from_secs(n)),
        Err(e) => {
            tracing::warn!(key, value = %val, error = %e, "Invalid duration, using default");
            None
        }
    }
}
