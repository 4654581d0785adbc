//! Shared-secret tokens of push hooks and job callbacks.
//!
//! The configuration only holds the sha256 hex digest of each token.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::ApiError;

pub const GITLAB_TOKEN_HEADER: &str = "X-Gitlab-Token";
pub const JOB_CALLBACK_TOKEN_HEADER: &str = "X-BPO-Token";

/// Hex encoded sha256 digest of a token.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Check the token sent in `header` against the configured digest.
///
/// A missing header is `Unauthorized`. A wrong token, or no digest
/// configured at all, is `Forbidden`.
pub fn verify_token(
    headers: &HeaderMap,
    header: &str,
    expected_hash: Option<&str>,
) -> Result<(), ApiError> {
    let token = headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized(format!("Missing {} header", header)))?;

    let Some(expected_hash) = expected_hash else {
        warn!(header, "No token configured, rejecting request");
        return Err(ApiError::Forbidden("Token is not configured".to_string()));
    };

    if !hash_token(token).eq_ignore_ascii_case(expected_hash.trim()) {
        warn!(header, "Invalid token");
        return Err(ApiError::Forbidden("Invalid token".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert(JOB_CALLBACK_TOKEN_HEADER, HeaderValue::from_str(token).unwrap());
        }
        headers
    }

    #[test]
    fn test_hash_token() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_token() {
        let hash = hash_token("secret");
        assert!(verify_token(&headers(Some("secret")), JOB_CALLBACK_TOKEN_HEADER, Some(&hash)).is_ok());
        assert!(matches!(
            verify_token(&headers(Some("wrong")), JOB_CALLBACK_TOKEN_HEADER, Some(&hash)),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            verify_token(&headers(None), JOB_CALLBACK_TOKEN_HEADER, Some(&hash)),
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            verify_token(&headers(Some("secret")), JOB_CALLBACK_TOKEN_HEADER, None),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn test_configured_hash_is_case_insensitive() {
        let hash = hash_token("secret").to_uppercase();
        assert!(verify_token(&headers(Some("secret")), JOB_CALLBACK_TOKEN_HEADER, Some(&hash)).is_ok());
    }
}
