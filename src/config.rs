use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurableBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct QStashConfig {
    pub url: String,
    pub token: String,
    /// Public base URL of this service; the callback target is `{backend_url}/v1/chat/flush`.
    pub backend_url: String,
}

#[derive(Debug, Clone)]
pub struct SigningKeys {
    pub current: Option<String>,
    pub next: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FlushConfig {
    pub batch_size: usize,
    pub idle_timeout: Duration,
    pub retries: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub redis_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub qstash: QStashConfig,
    pub signing: SigningKeys,
    pub flush: FlushConfig,
    pub redis_command_timeout: Duration,
    /// Per-statement bound for Postgres reads and writes.
    pub db_command_timeout: Duration,
    pub subscriber_buffer: usize,
    pub seen_lookup_concurrency: usize,
    pub shutdown_grace: Duration,
    pub buffer_backend: BufferBackend,
    pub durable_backend: DurableBackend,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let buffer_backend = match optional("BUFFER_BACKEND").as_deref() {
            None | Some("redis") => BufferBackend::Redis,
            Some("memory") => BufferBackend::Memory,
            Some(other) => {
                return Err(AppError::Config(format!("unknown BUFFER_BACKEND: {other}")))
            }
        };
        let durable_backend = match optional("DURABLE_BACKEND").as_deref() {
            None | Some("postgres") => DurableBackend::Postgres,
            Some("memory") => DurableBackend::Memory,
            Some(other) => {
                return Err(AppError::Config(format!("unknown DURABLE_BACKEND: {other}")))
            }
        };

        let database_url = optional("DATABASE_URL");
        if durable_backend == DurableBackend::Postgres && database_url.is_none() {
            return Err(AppError::Config("DATABASE_URL missing".into()));
        }

        let jwt_secret =
            optional("JWT_SECRET").ok_or_else(|| AppError::Config("JWT_SECRET missing".into()))?;

        Ok(Self {
            database_url,
            redis_url: optional("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
            port: parse_or("PORT", 8080)?,
            jwt_secret,
            qstash: QStashConfig {
                url: optional("QSTASH_URL").unwrap_or_else(|| "https://qstash.upstash.io".into()),
                token: optional("QSTASH_TOKEN").unwrap_or_default(),
                backend_url: optional("BACKEND_URL")
                    .unwrap_or_else(|| "http://localhost:8080".into()),
            },
            signing: SigningKeys {
                current: optional("QSTASH_CURRENT_SIGNING_KEY"),
                next: optional("QSTASH_NEXT_SIGNING_KEY"),
            },
            flush: FlushConfig {
                batch_size: positive("FLUSH_BATCH_SIZE", 20)?,
                idle_timeout: Duration::from_secs(positive("FLUSH_IDLE_TIMEOUT_SECS", 30)?),
                retries: parse_or("FLUSH_RETRIES", 3)?,
            },
            redis_command_timeout: Duration::from_millis(positive(
                "REDIS_COMMAND_TIMEOUT_MS",
                3000,
            )?),
            db_command_timeout: Duration::from_millis(positive("DB_COMMAND_TIMEOUT_MS", 5000)?),
            subscriber_buffer: positive("SUBSCRIBER_BUFFER", 256)?,
            seen_lookup_concurrency: positive("SEEN_LOOKUP_CONCURRENCY", 8)?,
            shutdown_grace: Duration::from_secs(parse_or("SHUTDOWN_GRACE_SECS", 10)?),
            buffer_backend,
            durable_backend,
        })
    }
}

/// Unset and blank variables are treated the same.
fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_value<T: FromStr>(name: &str, raw: Option<String>, default: T) -> Result<T, AppError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| AppError::Config(format!("{name} has invalid value: {value}"))),
    }
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    parse_value(name, optional(name), default)
}

fn positive<T>(name: &str, default: T) -> Result<T, AppError>
where
    T: FromStr + PartialOrd + Default,
{
    positive_value(name, optional(name), default)
}

fn positive_value<T>(name: &str, raw: Option<String>, default: T) -> Result<T, AppError>
where
    T: FromStr + PartialOrd + Default,
{
    let value = parse_value(name, raw, default)?;
    if value <= T::default() {
        return Err(AppError::Config(format!("{name} must be greater than zero")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_value_uses_default() {
        let value: u16 = parse_value("PORT", None, 8080).unwrap();
        assert_eq!(value, 8080);
    }

    #[test]
    fn garbage_value_is_a_config_error() {
        let err = parse_value::<usize>("FLUSH_BATCH_SIZE", Some("twenty".into()), 20).unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("FLUSH_BATCH_SIZE")));
    }

    #[test]
    fn parses_explicit_value() {
        let value: u64 = parse_value("SHUTDOWN_GRACE_SECS", Some("25".into()), 10).unwrap();
        assert_eq!(value, 25);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = positive_value::<u64>("DB_COMMAND_TIMEOUT_MS", Some("0".into()), 5000).unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("DB_COMMAND_TIMEOUT_MS")));

        let value = positive_value::<u64>("DB_COMMAND_TIMEOUT_MS", None, 5000).unwrap();
        assert_eq!(value, 5000);
    }
}
