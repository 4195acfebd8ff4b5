// CORS middleware configuration for the relay server.
//
// Allowed origins come from the `ATELIER_RELAY_CORS_ORIGINS` configuration
// value (comma-separated). Falls back to permissive localhost defaults in
// development.

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Default origins allowed when no origin list is configured.
const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
    "http://localhost:4200",
];

/// Build a [`CorsLayer`] from the configured origin list.
///
/// - `"*"` allows any origin (and disables credentials).
/// - A comma-separated list allows exactly those origins.
/// - `None` allows the default development origins.
///
/// All configurations:
/// - Allow credentials (cookies, Authorization header).
/// - Allow common HTTP methods (GET, POST, PUT, PATCH, DELETE, OPTIONS).
/// - Allow common headers (Content-Type, Authorization, X-Request-Id).
/// - Expose X-Request-Id to the browser.
/// - Cache preflight responses for 1 hour.
pub fn cors_layer_from_env(env_value: Option<String>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([HeaderName::from_static("x-request-id")])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600));

    match env_value.as_deref() {
        Some("*") => base.allow_origin(AllowOrigin::any()).allow_credentials(false),
        Some(origins) => {
            let parsed = parse_origins(origins);
            base.allow_origin(parsed)
        }
        None => {
            let defaults = parse_origins(&DEFAULT_DEV_ORIGINS.join(","));
            base.allow_origin(defaults)
        }
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
