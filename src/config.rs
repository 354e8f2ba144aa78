//! # Stage: Configuration
//!
//! ## Responsibility
//! Read every tunable from the process environment exactly once at startup
//! and hand the rest of the crate an immutable [`Config`].
//!
//! ## Guarantees
//! - Unset variables take their documented default.
//! - A variable that is set but empty, malformed or out of range is an error
//!   naming the variable; it never silently falls back to the default.
//! - Durations use Go notation (`500ms`, `2s`, `1m30s`).
//!
//! ## NOT Responsible For
//! - Reloading at runtime
//! - Config files or CLI flags

use std::time::Duration;

use crate::error::ConfigError;
use crate::stats::memory::DEFAULT_MAX_KEYS;

const MAX_STR_LEN_CEILING: i64 = 1000;
const MAX_HEADER_BYTES_CEILING: i64 = 10 << 20;

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Listen address; `:port` binds every interface.
    pub addr: String,
    pub max_limit: u64,
    /// Maximum byte length of `str1` / `str2`.
    pub max_str_len: usize,
    pub read_header_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub handler_timeout: Duration,
    pub max_header_bytes: usize,
    pub rate_limit: RateLimitConfig,
    pub cors: CorsConfig,
    pub stats: StatsConfig,
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    /// Requests per window per client IP on `/fizzbuzz`.
    pub fizzbuzz: u32,
    /// Requests per window per client IP on `/stats`.
    pub stats: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsConfig {
    /// When false no repository is built and `/stats` always answers 204.
    pub enabled: bool,
    /// In-memory cardinality cap; `0` = unbounded.
    pub max_keys: usize,
}

#[derive(Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub enabled: bool,
    pub addr: String,
    pub password: String,
    pub db: i64,
    pub dial_timeout: Duration,
    pub op_timeout: Duration,
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let password = if self.password.is_empty() { "" } else { "<redacted>" };
        f.debug_struct("RedisConfig")
            .field("enabled", &self.enabled)
            .field("addr", &self.addr)
            .field("password", &password)
            .field("db", &self.db)
            .field("dial_timeout", &self.dial_timeout)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: ":8090".to_string(),
            max_limit: 100_000,
            max_str_len: 50,
            read_header_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            handler_timeout: Duration::from_secs(30),
            max_header_bytes: 1 << 20,
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(60),
                fizzbuzz: 30,
                stats: 10,
            },
            // Never default to "*": CORS must be configured explicitly.
            cors: CorsConfig::default(),
            stats: StatsConfig {
                enabled: true,
                max_keys: DEFAULT_MAX_KEYS,
            },
            redis: RedisConfig {
                enabled: false,
                addr: "localhost:6379".to_string(),
                password: String::new(),
                db: 0,
                dial_timeout: Duration::from_secs(2),
                op_timeout: Duration::from_secs(1),
            },
        }
    }
}

impl Config {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut cfg = Config::default();

        cfg.addr = env.string("ADDR", &cfg.addr);
        if cfg.addr.trim().is_empty() {
            return Err(ConfigError::new("ADDR", "must not be empty"));
        }

        cfg.max_limit = positive("MAX_LIMIT", env.int("MAX_LIMIT", cfg.max_limit as i64)?)?;

        let max_str_len = env.int("MAX_STR_LEN", cfg.max_str_len as i64)?;
        cfg.max_str_len = positive("MAX_STR_LEN", max_str_len)? as usize;
        if max_str_len > MAX_STR_LEN_CEILING {
            return Err(ConfigError::new(
                "MAX_STR_LEN",
                format!("must be <= {MAX_STR_LEN_CEILING}"),
            ));
        }

        cfg.read_header_timeout = env.duration("READ_HEADER_TIMEOUT", cfg.read_header_timeout)?;
        cfg.write_timeout = env.duration("WRITE_TIMEOUT", cfg.write_timeout)?;
        cfg.shutdown_timeout = env.duration("SHUTDOWN_TIMEOUT", cfg.shutdown_timeout)?;
        cfg.handler_timeout = env.duration("HTTP_HANDLER_TIMEOUT", cfg.handler_timeout)?;

        let header_bytes = env.int("MAX_HEADER_BYTES", cfg.max_header_bytes as i64)?;
        cfg.max_header_bytes = positive("MAX_HEADER_BYTES", header_bytes)? as usize;
        if header_bytes > MAX_HEADER_BYTES_CEILING {
            return Err(ConfigError::new(
                "MAX_HEADER_BYTES",
                format!("must be <= {MAX_HEADER_BYTES_CEILING}"),
            ));
        }

        cfg.rate_limit.window = env.duration("RATE_LIMIT_WINDOW", cfg.rate_limit.window)?;
        cfg.rate_limit.fizzbuzz = per_window(
            "RATE_LIMIT_FIZZBUZZ",
            env.int("RATE_LIMIT_FIZZBUZZ", cfg.rate_limit.fizzbuzz.into())?,
        )?;
        cfg.rate_limit.stats = per_window(
            "RATE_LIMIT_STATS",
            env.int("RATE_LIMIT_STATS", cfg.rate_limit.stats.into())?,
        )?;

        cfg.cors.enabled = env.bool("CORS_ENABLED", cfg.cors.enabled)?;
        let origins = env.string("CORS_ALLOWED_ORIGINS", "");
        if !origins.trim().is_empty() {
            cfg.cors.allowed_origins = split_csv(&origins);
        }
        if cfg.cors.enabled && cfg.cors.allowed_origins.is_empty() {
            return Err(ConfigError::new(
                "CORS_ALLOWED_ORIGINS",
                "must be set when CORS_ENABLED=true",
            ));
        }

        cfg.stats.enabled = env.bool("STATS_ENABLED", cfg.stats.enabled)?;
        let max_keys = env.int("STATS_MAX_KEYS", cfg.stats.max_keys as i64)?;
        if max_keys < 0 {
            return Err(ConfigError::new("STATS_MAX_KEYS", "must be >= 0"));
        }
        cfg.stats.max_keys = max_keys as usize;

        cfg.redis.enabled = env.bool("REDIS_ENABLED", cfg.redis.enabled)?;
        cfg.redis.addr = env.string("REDIS_ADDR", &cfg.redis.addr);
        cfg.redis.password = env.string("REDIS_PASSWORD", &cfg.redis.password);
        cfg.redis.db = env.int("REDIS_DB", cfg.redis.db)?;
        if cfg.redis.db < 0 {
            return Err(ConfigError::new("REDIS_DB", "must be >= 0"));
        }
        cfg.redis.dial_timeout = env.duration("REDIS_DIAL_TIMEOUT", cfg.redis.dial_timeout)?;
        if cfg.redis.enabled && cfg.redis.addr.trim().is_empty() {
            return Err(ConfigError::new(
                "REDIS_ADDR",
                "must not be empty when REDIS_ENABLED=true",
            ));
        }
        cfg.redis.op_timeout = env.duration("REDIS_OP_TIMEOUT", cfg.redis.op_timeout)?;

        Ok(cfg)
    }

    /// Socket address to bind: `:8090` becomes `0.0.0.0:8090`.
    pub fn bind_addr(&self) -> String {
        if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Lookup helpers
// ---------------------------------------------------------------------------

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: &str) -> String {
        (self.lookup)(key).unwrap_or_else(|| default.to_string())
    }

    /// Trimmed raw value, `None` when unset, error when set but blank.
    fn present(&self, key: &'static str) -> Result<Option<String>, ConfigError> {
        match (self.lookup)(key) {
            None => Ok(None),
            Some(raw) => {
                let v = raw.trim();
                if v.is_empty() {
                    Err(ConfigError::new(key, "is set but empty"))
                } else {
                    Ok(Some(v.to_string()))
                }
            }
        }
    }

    fn int(&self, key: &'static str, default: i64) -> Result<i64, ConfigError> {
        match self.present(key)? {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|e| ConfigError::new(key, format!("invalid int {v:?}: {e}"))),
        }
    }

    /// Parsed and checked to be strictly positive.
    fn duration(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let d = match self.present(key)? {
            None => default,
            Some(v) => parse_duration(&v)
                .map_err(|e| ConfigError::new(key, format!("invalid duration {v:?}: {e}")))?,
        };
        if d.is_zero() {
            return Err(ConfigError::new(key, "must be > 0"));
        }
        Ok(d)
    }

    fn bool(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        let Some(v) = self.present(key)? else {
            return Ok(default);
        };
        match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Ok(true),
            "0" | "false" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::new(
                key,
                format!("invalid bool {v:?} (expected true/false)"),
            )),
        }
    }
}

fn positive(key: &'static str, n: i64) -> Result<u64, ConfigError> {
    if n <= 0 {
        return Err(ConfigError::new(key, "must be > 0"));
    }
    Ok(n as u64)
}

fn per_window(key: &'static str, n: i64) -> Result<u32, ConfigError> {
    let n = positive(key, n)?;
    u32::try_from(n).map_err(|_| ConfigError::new(key, format!("must be <= {}", u32::MAX)))
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// Parse a Go-style duration: one or more `<number><unit>` terms such as
/// `300ms`, `1.5h` or `2h45m`. A bare `0` is accepted. Negative values are
/// rejected since every duration here must be positive.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let rest = s.strip_prefix('+').unwrap_or(s);
    if rest.starts_with('-') {
        return Err("must not be negative".to_string());
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err("empty".to_string());
    }

    let mut nanos = 0f64;
    let mut rest = rest;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| "missing unit".to_string())?;
        let (num, tail) = rest.split_at(num_end);
        if num.is_empty() || num == "." {
            return Err("expected number".to_string());
        }
        let value: f64 = num.parse().map_err(|_| format!("bad number {num:?}"))?;

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            other => return Err(format!("unknown unit {other:?}")),
        };
        nanos += value * scale;
        rest = tail;
    }

    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err("out of range".to_string());
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}
