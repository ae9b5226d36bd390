//! Transcript webhook signature verification.
//!
//! The provider signs each delivery with a header of the form
//! `t=<unix seconds>,v0=<hex hmac>` where the HMAC-SHA256 is computed over
//! `"<t>.<raw body>"` with the shared secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

use crate::error::{ApiError, ApiResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Option<String>,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: Option<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            tolerance,
        }
    }

    /// A verifier that accepts every request. Development only.
    pub fn disabled() -> Self {
        Self {
            secret: None,
            tolerance: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Check `signature_header` against `body` as of `now_unix`.
    pub fn verify(&self, signature_header: Option<&str>, body: &[u8], now_unix: i64) -> ApiResult<()> {
        let Some(secret) = self.secret.as_deref() else {
            return Ok(());
        };

        let header = signature_header.ok_or_else(|| ApiError::unauthorized("Missing webhook signature"))?;
        let (timestamp, signature_hex) = parse_signature_header(header)?;

        let age_secs = (now_unix - timestamp).unsigned_abs();
        if age_secs > self.tolerance.as_secs() {
            return Err(ApiError::unauthorized("Stale webhook signature"));
        }

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| ApiError::internal_error("Failed to initialize HMAC"))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);

        let expected = hex::decode(signature_hex)
            .map_err(|_| ApiError::unauthorized("Invalid webhook signature encoding"))?;

        mac.verify_slice(&expected)
            .map_err(|_| ApiError::unauthorized("Invalid webhook signature"))?;

        Ok(())
    }
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("enabled", &self.is_enabled())
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

fn parse_signature_header(header: &str) -> ApiResult<(i64, &str)> {
    let mut timestamp: Option<i64> = None;
    let mut signature: Option<&str> = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("t=") {
            timestamp = value.parse::<i64>().ok();
        } else if let Some(value) = part.strip_prefix("v0=") {
            signature = Some(value);
        }
    }

    let timestamp = timestamp.ok_or_else(|| ApiError::unauthorized("Missing webhook timestamp"))?;
    let signature = signature.ok_or_else(|| ApiError::unauthorized("Missing webhook signature"))?;

    Ok((timestamp, signature))
}

/// Build a signature header for `body`, as the provider would.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> ApiResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ApiError::internal_error("Failed to initialize HMAC"))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(format!(
        "t={},v0={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    const SECRET: &str = "whsec_test";
    const NOW: i64 = 1_760_000_000;

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(Some(SECRET.to_string()), Duration::from_secs(1800))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let body = br#"{"conversation_id":"conv_1"}"#;
        let header = sign_payload(SECRET, NOW - 60, body).unwrap();
        verifier().verify(Some(&header), body, NOW).unwrap();
    }

    #[test]
    fn test_tampered_body_rejected() {
        let header = sign_payload(SECRET, NOW, b"original").unwrap();
        let err = verifier().verify(Some(&header), b"tampered", NOW).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let body = b"{}";
        let header = sign_payload(SECRET, NOW - 3600, body).unwrap();
        let err = verifier().verify(Some(&header), body, NOW).unwrap_err();
        assert_eq!(err.message, "Stale webhook signature");
    }

    #[test]
    fn test_missing_or_malformed_header_rejected() {
        assert!(verifier().verify(None, b"{}", NOW).is_err());
        assert!(verifier().verify(Some("v0=abcd"), b"{}", NOW).is_err());
        assert!(verifier().verify(Some("t=1760000000,v0=zz"), b"{}", NOW).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = b"{}";
        let header = sign_payload("other", NOW, body).unwrap();
        assert!(verifier().verify(Some(&header), body, NOW).is_err());
    }

    #[test]
    fn test_disabled_accepts_anything() {
        let verifier = WebhookVerifier::new(Some(String::new()), Duration::from_secs(1));
        assert!(!verifier.is_enabled());
        verifier.verify(None, b"anything", NOW).unwrap();
    }
}
