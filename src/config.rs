use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub api_base_url: String,
    pub host: IpAddr,
    pub port: u16,
    pub log_level: String,
    pub probe_interval: Duration,
    pub sync: SyncSettings,
}

/// Tunables of the sync engine.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: f64,
    /// Failed attempts after which a mutation is dead-lettered.
    pub max_attempts: u32,
    pub debounce: Duration,
    pub request_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            backoff_jitter: 0.25,
            max_attempts: 5,
            debounce: Duration::from_millis(1500),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url = env_or("HOMESYNC_DATABASE_URL", "sqlite://homesync.db?mode=rwc");
        let api_base_url = env_required("HOMESYNC_API_BASE_URL")?;

        let host: IpAddr = env_or("HOMESYNC_HOST", "127.0.0.1")
            .parse()
            .map_err(|e| format!("Invalid HOMESYNC_HOST: {e}"))?;

        let port: u16 = env_parse("HOMESYNC_PORT", "4010")?;
        let log_level = env_or("HOMESYNC_LOG_LEVEL", "info");
        let probe_interval = Duration::from_secs(env_parse("HOMESYNC_PROBE_INTERVAL_SECS", "10")?);

        let sync = SyncSettings {
            backoff_base: Duration::from_millis(env_parse("HOMESYNC_BACKOFF_BASE_MS", "1000")?),
            backoff_max: Duration::from_millis(env_parse("HOMESYNC_BACKOFF_MAX_MS", "300000")?),
            backoff_jitter: env_parse("HOMESYNC_BACKOFF_JITTER", "0.25")?,
            max_attempts: env_parse("HOMESYNC_MAX_ATTEMPTS", "5")?,
            debounce: Duration::from_millis(env_parse("HOMESYNC_DEBOUNCE_MS", "1500")?),
            request_timeout: Duration::from_secs(env_parse("HOMESYNC_REQUEST_TIMEOUT_SECS", "30")?),
        };

        if sync.max_attempts == 0 {
            return Err("HOMESYNC_MAX_ATTEMPTS must be at least 1".to_string());
        }

        Ok(Config {
            database_url,
            api_base_url,
            host,
            port,
            log_level,
            probe_interval,
            sync,
        })
    }
}

fn env_required(key: &str) -> Result<String, String> {
    std::env::var(key).map_err(|_| format!("Missing required environment variable: {key}"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_or(key, default)
        .parse()
        .map_err(|e| format!("Invalid {key}: {e}"))
}
