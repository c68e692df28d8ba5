use std::hint::black_box;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use crate::bail_gateway;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::AppState;

/// Rejects requests that do not carry the configured API key.
/// Passes everything through when no key is configured.
pub(crate) async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> GatewayResult<Response> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let header = match request.headers().get(AUTHORIZATION) {
        Some(value) => match value.to_str() {
            Ok(value) => value,
            Err(_) => bail_gateway!(StatusCode::UNAUTHORIZED, "Invalid Authorization header"),
        },
        None => bail_gateway!(StatusCode::UNAUTHORIZED, "Missing Authorization header"),
    };

    if !keys_match(bearer_token(header), expected) {
        return Err(GatewayError::unauthorized("Invalid API key"));
    }
    Ok(next.run(request).await)
}

/// Strips an optional `Bearer` scheme from the header value.
fn bearer_token(header: &str) -> &str {
    let header = header.trim();
    match header.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
        _ => header,
    }
}

fn keys_match(presented: &str, expected: &str) -> bool {
    let (presented, expected) = (presented.as_bytes(), expected.as_bytes());
    if presented.len() != expected.len() {
        return false;
    }
    let diff = presented
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    black_box(diff) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_optional_bearer_prefix() {
        assert_eq!(bearer_token("Bearer abc"), "abc");
        assert_eq!(bearer_token("bearer   abc "), "abc");
        assert_eq!(bearer_token("abc"), "abc");
        assert_eq!(bearer_token("  abc  "), "abc");
        assert_eq!(bearer_token("Bearer "), "Bearer");
        assert_eq!(bearer_token("Basic abc"), "Basic abc");
    }

    #[test]
    fn compares_keys() {
        assert!(keys_match("secret", "secret"));
        assert!(!keys_match("secreT", "secret"));
        assert!(!keys_match("secret-but-longer", "secret"));
        assert!(!keys_match("", "secret"));
    }
}
