use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub persist_path: Option<PathBuf>,
    pub feed_capacity: usize,
    pub public_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            persist_path: None,
            feed_capacity: 32,
            public_base_url: "http://localhost:3000".to_string(),
        }
    }
}

impl Config {
    /// Reads `BIND_ADDR`, `PERSIST_PATH`, `FEED_CAPACITY` and
    /// `PUBLIC_BASE_URL`, falling back to the defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            persist_path: env::var("PERSIST_PATH").ok().map(PathBuf::from),
            feed_capacity: env_parse("FEED_CAPACITY", defaults.feed_capacity),
            public_base_url: env::var("PUBLIC_BASE_URL").unwrap_or(defaults.public_base_url),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Timing knobs for a single room session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifecycle timer period.
    pub tick: Duration,
    /// Delay between a room-closed notice and navigating away.
    pub closed_grace: Duration,
    /// Delay between leaving or ending a room and navigating away.
    pub exit_grace: Duration,
    /// Fixed seed for the draw; entropy when unset.
    pub draw_seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            closed_grace: Duration::from_secs(2),
            exit_grace: Duration::from_secs(1),
            draw_seed: None,
        }
    }
}
