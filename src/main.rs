use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, HeaderValue, Method, header::CONTENT_DISPOSITION},
    response::Response,
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};
use url::Url;

mod auth;
mod config;
mod error;
mod pipeline;
mod ratelimit;
mod resolver;
mod tempstore;

use auth::SessionGate;
use config::Config;
use error::ApiError;
use ratelimit::FixedWindowLimiter;
use resolver::{RESOLVER_TIMEOUT_SECONDS, Resolver, VideoInfo};
use tempstore::TempStore;

const MEDIA_CONNECT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    sessions: Arc<Mutex<SessionGate>>,
    rate_limits: Arc<Mutex<FixedWindowLimiter>>,
    temp_store: TempStore,
    resolver: Resolver,
    media_client: reqwest::Client,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "mp3tube=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Arc::new(Config::from_env()?);

    let temp_store = TempStore::init(
        config.temp_dir.clone(),
        Duration::from_secs(config.temp_max_age_seconds),
    )
    .await?;
    let _sweeper = tempstore::spawn_sweeper(
        temp_store.clone(),
        Duration::from_secs(config.sweep_interval_seconds),
    );

    let api_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(RESOLVER_TIMEOUT_SECONDS))
        .build()
        .map_err(|error| ApiError::internal(format!("Could not build HTTP client: {error}")))?;

    // Redirects on the media download are followed manually in the pipeline
    // with a hard hop ceiling, so this client must not follow them itself.
    let media_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(MEDIA_CONNECT_TIMEOUT_SECONDS))
        .build()
        .map_err(|error| ApiError::internal(format!("Could not build HTTP client: {error}")))?;

    let resolver = Resolver::new(
        api_client,
        config.resolver_endpoint.clone(),
        config.resolver_api_key.clone(),
    );

    let state = AppState {
        sessions: Arc::new(Mutex::new(SessionGate::new(
            config.password.as_deref(),
            config.session_ttl_hours,
        ))),
        rate_limits: Arc::new(Mutex::new(FixedWindowLimiter::new(
            config.rate_limit_max,
            config.rate_limit_window_seconds,
        ))),
        temp_store,
        resolver,
        media_client,
        config: config.clone(),
    };

    let cors = build_cors_layer(&config.allowed_origins)?;

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/api/auth", post(authenticate))
        .route("/api/info", get(video_info))
        .route("/api/convert", get(convert).post(convert))
        .with_state(state)
        .layer(cors);

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!("mp3tube listening on http://{}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct AuthRequest {
    password: String,
}

#[derive(Debug, Serialize)]
struct AuthResponse {
    success: bool,
    token: String,
}

async fn authenticate(
    State(state): State<AppState>,
    Json(payload): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let mut sessions = state.sessions.lock().await;
    if !sessions.enabled() {
        return Err(ApiError::unauthorized(
            "Authentication is disabled on this server.",
        ));
    }

    let token = sessions
        .authenticate(&payload.password, Utc::now())
        .ok_or_else(|| ApiError::unauthorized("Invalid password."))?;

    Ok(Json(AuthResponse {
        success: true,
        token,
    }))
}

#[derive(Debug, Deserialize)]
struct InfoParams {
    url: String,
    token: Option<String>,
}

async fn video_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<InfoParams>,
) -> Result<Json<VideoInfo>, ApiError> {
    if state.config.protect_info {
        require_token(&state, &headers, params.token.as_deref()).await?;
    }

    let video_id = pipeline::validate_and_extract(&params.url)?;
    let info = state.resolver.fetch_info(&video_id).await?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
struct ConvertParams {
    url: String,
    quality: Option<String>,
    token: Option<String>,
}

async fn convert(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ConvertParams>,
) -> Result<Response, ApiError> {
    require_token(&state, &headers, params.token.as_deref()).await?;

    let client_ip = client_ip_for_request(&state, &headers, addr);
    {
        let mut rate_limits = state.rate_limits.lock().await;
        if let Err(retry_after) = rate_limits.check(&client_ip, Utc::now()) {
            debug!("Throttled conversion request from {client_ip}");
            return Err(ApiError::rate_limited(retry_after));
        }
    }

    pipeline::convert(
        &state.resolver,
        &state.temp_store,
        &state.media_client,
        &params.url,
        params.quality.as_deref(),
    )
    .await
}

/// Gate check for protected endpoints. The token may arrive as a bearer
/// header or, for direct browser downloads, as a `token` query parameter.
async fn require_token(
    state: &AppState,
    headers: &HeaderMap,
    token_param: Option<&str>,
) -> Result<(), ApiError> {
    let sessions = state.sessions.lock().await;
    if !sessions.enabled() {
        return Ok(());
    }

    let token = bearer_token(headers)
        .or_else(|| token_param.map(ToString::to_string))
        .ok_or_else(|| ApiError::unauthorized("Authentication required."))?;

    if !sessions.is_authorized(&token, Utc::now()) {
        return Err(ApiError::unauthorized("Invalid or expired session."));
    }
    Ok(())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

fn client_ip_for_request(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> String {
    if state.config.trust_proxy_headers {
        extract_client_ip(headers).unwrap_or_else(|| addr.ip().to_string())
    } else {
        addr.ip().to_string()
    }
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let origins = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Falling back to development origins.");
        vec![
            "http://127.0.0.1:5173".to_string(),
            "http://localhost:5173".to_string(),
        ]
    } else {
        configured.to_vec()
    };

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });
    info!(
        "CORS allow-list loaded with {} origin(s)",
        allowed_origins.len()
    );

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let port = parsed.port();

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    let include_port = port.is_some_and(|explicit| explicit != default_port);

    if include_port {
        Some(format!("{scheme}://{host}:{}", port?))
    } else {
        Some(format!("{scheme}://{host}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_is_parsed_from_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));

        headers.insert("authorization", HeaderValue::from_static("Basic abc123"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn forwarded_ip_takes_the_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn origin_normalization_drops_default_ports() {
        assert_eq!(
            normalize_origin("https://example.com:443").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_origin("http://localhost:5173").as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(normalize_origin("https://example.com/path"), None);
    }
}
