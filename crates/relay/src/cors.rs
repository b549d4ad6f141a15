// Origin policy for HTTP CORS and WebSocket upgrades.
//
// Allowed origins come from `PARLEY_RELAY_CORS_ORIGINS` (comma-separated,
// or `*` for any). When unset the local development origins are allowed.

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Origins allowed when no list is configured.
const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

/// Build a [`CorsLayer`] for the configured origin list.
///
/// `"*"` allows any origin without credentials; anything else allows
/// exactly the listed origins with credentials. Preflight responses are
/// cached for an hour and `x-request-id` is exposed to browsers.
pub fn cors_layer(configured: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([HeaderName::from_static("x-request-id")])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600));

    match configured {
        Some("*") => base.allow_origin(AllowOrigin::any()).allow_credentials(false),
        Some(origins) => base.allow_origin(parse_origins(origins)),
        None => base.allow_origin(parse_origins(&DEFAULT_DEV_ORIGINS.join(","))),
    }
}

/// Whether a WebSocket upgrade carrying `origin` may proceed.
pub fn origin_allowed(configured: Option<&str>, origin: &str) -> bool {
    match configured {
        Some("*") => true,
        Some(origins) => parse_origins(origins).iter().any(|allowed| allowed == origin),
        None => DEFAULT_DEV_ORIGINS.contains(&origin),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect()
}
