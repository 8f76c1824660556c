use std::path::PathBuf;

use tracing::warn;

use crate::error::ApiError;

const DEFAULT_SESSION_TTL_HOURS: i64 = 24;
const DEFAULT_RATE_LIMIT_MAX: u32 = 20;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: i64 = 60 * 60;
const DEFAULT_TEMP_MAX_AGE_SECONDS: u64 = 30 * 60;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 10 * 60;

/// Everything the process reads from the environment, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    /// Shared secret for the access gate. `None` disables authentication on
    /// every endpoint.
    pub password: Option<String>,
    /// Whether `/api/info` also requires a token when the gate is enabled.
    pub protect_info: bool,
    pub resolver_endpoint: String,
    pub resolver_api_key: Option<String>,
    pub session_ttl_hours: i64,
    pub rate_limit_max: u32,
    pub rate_limit_window_seconds: i64,
    pub temp_max_age_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub temp_dir: PathBuf,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ApiError> {
        let resolver_endpoint = std::env::var("RESOLVER_ENDPOINT")
            .ok()
            .and_then(|value| non_empty(&value).map(ToString::to_string))
            .ok_or_else(|| {
                ApiError::internal("RESOLVER_ENDPOINT is not set. Point it at the resolution API.")
            })?;

        let password = std::env::var("APP_PASSWORD")
            .ok()
            .and_then(|value| non_empty(&value).map(ToString::to_string));
        if password.is_none() {
            warn!("APP_PASSWORD not set. The converter will run without authentication.");
        }

        let temp_dir = std::env::var("TEMP_DIR")
            .ok()
            .and_then(|value| non_empty(&value).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("temp_audio"));

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_addr: resolve_bind_addr(),
            password,
            protect_info: read_bool_env("PROTECT_INFO").unwrap_or(false),
            resolver_endpoint,
            resolver_api_key: std::env::var("RESOLVER_API_KEY")
                .ok()
                .and_then(|value| non_empty(&value).map(ToString::to_string)),
            session_ttl_hours: read_i64_env("SESSION_TTL_HOURS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_SESSION_TTL_HOURS),
            rate_limit_max: read_u32_env("RATE_LIMIT_MAX")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_RATE_LIMIT_MAX),
            rate_limit_window_seconds: read_i64_env("RATE_LIMIT_WINDOW_SECONDS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECONDS),
            temp_max_age_seconds: read_u64_env("TEMP_MAX_AGE_SECONDS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_TEMP_MAX_AGE_SECONDS),
            sweep_interval_seconds: read_u64_env("SWEEP_INTERVAL_SECONDS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECONDS),
            temp_dir,
            trust_proxy_headers: read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false),
            allowed_origins,
        })
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8787".to_string()
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_i64_env(name: &str) -> Option<i64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
}

fn read_u32_env(name: &str) -> Option<u32> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
