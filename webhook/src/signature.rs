//! Signature verification for the webhook sources §6 names explicitly.
//! Everything else passes through unverified — the endpoint's `source`
//! string is an arbitrary label for unknown front-ends, not a closed set.

use axum::http::HeaderMap;
use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::Result;
use crate::error::WebhookError;

type HmacSha256 = Hmac<Sha256>;

/// Verifies `body` against the scheme `source` implies. A `None` secret
/// means the endpoint was configured without one, so the check is skipped
/// entirely regardless of `source` — an intentionally open endpoint.
pub fn verify(source: &str, secret: Option<&str>, headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let Some(secret) = secret else {
        return Ok(());
    };
    match source {
        "gitlab" => verify_gitlab_token(secret, headers),
        "github" => verify_github_signature(secret, headers, body),
        _ => Ok(()),
    }
}

/// GitLab sends the configured secret back verbatim in `X-Gitlab-Token`;
/// there is no HMAC, just a direct (constant-time) comparison.
fn verify_gitlab_token(secret: &str, headers: &HeaderMap) -> Result<()> {
    let token = headers
        .get("x-gitlab-token")
        .and_then(|value| value.to_str().ok())
        .ok_or(WebhookError::MissingSignature)?;
    if token.as_bytes().ct_eq(secret.as_bytes()).unwrap_u8() == 1 {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

/// GitHub-style `X-Hub-Signature-256: sha256=<hex hmac of body>`.
fn verify_github_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let header = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok())
        .ok_or(WebhookError::MissingSignature)?;
    let expected_hex = header.strip_prefix("sha256=").unwrap_or(header);

    // Any key length is accepted by HMAC; this never actually errors.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(body);
    let computed_hex = hex::encode(mac.finalize().into_bytes());

    if computed_hex.as_bytes().ct_eq(expected_hex.as_bytes()).unwrap_u8() == 1 {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use axum::http::HeaderMap;
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn no_secret_configured_skips_verification() {
        let headers = HeaderMap::new();
        assert!(verify("github", None, &headers, b"{}").is_ok());
    }

    #[test]
    fn unknown_source_is_never_verified() {
        let headers = HeaderMap::new();
        assert!(verify("custom-cron", Some("s"), &headers, b"{}").is_ok());
    }

    #[test]
    fn gitlab_token_must_match_exactly() {
        let mut headers = HeaderMap::new();
        headers.insert("x-gitlab-token", HeaderValue::from_static("s3cr3t"));
        assert!(verify("gitlab", Some("s3cr3t"), &headers, b"{}").is_ok());
        assert!(matches!(verify("gitlab", Some("other"), &headers, b"{}"), Err(WebhookError::InvalidSignature)));
    }

    #[test]
    fn gitlab_without_header_is_missing_signature() {
        let headers = HeaderMap::new();
        assert!(matches!(verify("gitlab", Some("s3cr3t"), &headers, b"{}"), Err(WebhookError::MissingSignature)));
    }

    #[test]
    fn github_signature_round_trips() {
        let body = b"{\"ok\":true}";
        let mut mac = HmacSha256::new_from_slice(b"secret").expect("hmac key");
        mac.update(body);
        let digest = hex::encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", HeaderValue::from_str(&format!("sha256={digest}")).expect("header value"));
        assert!(verify("github", Some("secret"), &headers, body).is_ok());

        headers.insert("x-hub-signature-256", HeaderValue::from_static("sha256=deadbeef"));
        assert!(matches!(verify("github", Some("secret"), &headers, body), Err(WebhookError::InvalidSignature)));
    }
}
