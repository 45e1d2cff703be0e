//! Gateway auth: one shared bearer secret, plus per-instance access tokens
//! for the file-recall endpoints.

use axum::http::{header, HeaderMap, StatusCode};

/// Checks `Authorization: Bearer <secret>` against the configured secret.
///
/// An empty configured secret disables gateway auth (local development).
pub fn check_bearer(headers: &HeaderMap, secret: &str) -> Result<(), StatusCode> {
    if secret.is_empty() {
        return Ok(());
    }
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == secret => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

/// Reads the `X-Access-Token` header for per-instance recall auth.
pub fn access_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-access-token").and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(v) = value {
            headers.insert(header::AUTHORIZATION, v.parse().unwrap());
        }
        headers
    }

    /// **Scenario**: matching bearer passes; missing or wrong returns 401.
    #[test]
    fn bearer_matching() {
        assert!(check_bearer(&headers(Some("Bearer s3cret")), "s3cret").is_ok());
        assert_eq!(
            check_bearer(&headers(Some("Bearer wrong")), "s3cret").unwrap_err(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            check_bearer(&headers(None), "s3cret").unwrap_err(),
            StatusCode::UNAUTHORIZED
        );
        // Empty secret disables the check.
        assert!(check_bearer(&headers(None), "").is_ok());
    }
}
