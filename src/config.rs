//! Server configuration
//!
//! Read from environment variables at startup. Empty values count as
//! unset so `APP_SECRET=` behaves like a missing secret.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::message::TagField;

/// Default heartbeat interval
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(30_000);

/// Default relay channel
pub const DEFAULT_CHANNEL: &str = "global";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Shared JWT secret; `None` runs unauthenticated
    pub secret: Option<String>,
    /// Redis URL for the relay; `None` uses the in-process bus
    pub redis_url: Option<String>,
    pub redis_password: Option<String>,
    /// Relay channels to subscribe to; the first is the default for publishing
    pub channels: Vec<String>,
    pub ping_interval: Duration,
    pub tag_field: TagField,
    /// Upper bound on a single socket write
    pub write_timeout: Duration,
    /// Time a new TCP peer gets to complete the WebSocket upgrade
    pub handshake_timeout: Duration,
    /// Per-connection outbound queue capacity
    pub outbound_buffer: usize,
    /// Consecutive relay reconnect attempts before giving up
    pub relay_max_retries: u32,
    /// Run as a supervisor forking workers
    pub cluster: bool,
    /// Worker count in cluster mode, 0 = one per CPU
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            secret: None,
            redis_url: None,
            redis_password: None,
            channels: vec![DEFAULT_CHANNEL.to_string()],
            ping_interval: DEFAULT_PING_INTERVAL,
            tag_field: TagField::default(),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            outbound_buffer: 64,
            relay_max_retries: 5,
            cluster: false,
            workers: 0,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let channels = match get("RELAY_CHANNELS") {
            Some(raw) => {
                let channels: Vec<String> = raw
                    .split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect();
                if channels.is_empty() {
                    return Err(ConfigError::Empty("RELAY_CHANNELS"));
                }
                channels
            }
            None => defaults.channels,
        };

        let tag_field = match get("TYPE_KEY") {
            Some(raw) => TagField::parse(raw.trim())?,
            None => defaults.tag_field,
        };

        let outbound_buffer = parse(&get, "OUTBOUND_BUFFER", defaults.outbound_buffer)?;
        if outbound_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OUTBOUND_BUFFER",
                value: "0".to_string(),
            });
        }

        let ping_ms = parse(&get, "PING_INTERVAL", defaults.ping_interval.as_millis() as u64)?;
        if ping_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PING_INTERVAL",
                value: "0".to_string(),
            });
        }

        // Workers only reach each other through the relay
        let cluster = parse_flag(&get, "CLUSTER")?;
        let redis_url = get("REDIS_PUBSUB_SERVICE");
        if cluster && redis_url.is_none() {
            return Err(ConfigError::Empty("REDIS_PUBSUB_SERVICE"));
        }

        Ok(Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse(&get, "PORT", defaults.port)?,
            secret: get("APP_SECRET"),
            redis_url,
            redis_password: get("REDIS_PUBSUB_PASSWORD"),
            channels,
            ping_interval: Duration::from_millis(ping_ms),
            tag_field,
            write_timeout: Duration::from_millis(parse(
                &get,
                "WRITE_TIMEOUT",
                defaults.write_timeout.as_millis() as u64,
            )?),
            handshake_timeout: Duration::from_millis(parse(
                &get,
                "HANDSHAKE_TIMEOUT",
                defaults.handshake_timeout.as_millis() as u64,
            )?),
            outbound_buffer,
            relay_max_retries: parse(&get, "RELAY_MAX_RETRIES", defaults.relay_max_retries)?,
            cluster,
            workers: parse(&get, "WORKERS", defaults.workers)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Channel used when a handler does not name one
    pub fn default_channel(&self) -> &str {
        self.channels
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_CHANNEL)
    }

    /// Number of workers to fork in cluster mode
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

fn parse_flag<G>(get: &G, key: &'static str) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value: v }),
        },
    }
}
