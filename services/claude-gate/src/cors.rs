//! CORS response headers
//!
//! Local web clients (IDE plugins, browser playgrounds) call the gateway
//! cross-origin. Every response carries the CORS header set; preflight
//! requests short-circuit with 204.

use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const ALLOW_HEADERS: &str =
    "Content-Type, Authorization, X-Requested-With, anthropic-version, anthropic-beta";
const MAX_AGE: &str = "3600";

/// Attach the CORS header set, echoing the request origin when present.
pub fn apply(headers: &mut HeaderMap, origin: Option<&HeaderValue>) {
    let origin = origin
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(MAX_AGE));
}

/// 204 preflight response with the full CORS header set.
pub fn preflight(origin: Option<&HeaderValue>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply(response.headers_mut(), origin);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_the_request_origin() {
        let mut headers = HeaderMap::new();
        let origin = HeaderValue::from_static("http://localhost:3000");
        apply(&mut headers, Some(&origin));
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://localhost:3000"
        );
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
            "true"
        );
        assert_eq!(headers.get(ACCESS_CONTROL_MAX_AGE).unwrap(), "3600");
    }

    #[test]
    fn falls_back_to_wildcard_without_origin() {
        let mut headers = HeaderMap::new();
        apply(&mut headers, None);
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }

    #[test]
    fn allowed_headers_cover_the_anthropic_pair() {
        let mut headers = HeaderMap::new();
        apply(&mut headers, None);
        let allowed = headers
            .get(ACCESS_CONTROL_ALLOW_HEADERS)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(allowed.contains("anthropic-version"));
        assert!(allowed.contains("anthropic-beta"));
        assert!(allowed.contains("Authorization"));
    }

    #[test]
    fn preflight_is_204_with_cors() {
        let response = preflight(None);
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(
            response
                .headers()
                .get(ACCESS_CONTROL_ALLOW_METHODS)
                .is_some()
        );
    }
}
