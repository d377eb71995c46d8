//! Timestamped HMAC-SHA256 signatures for inbound webhook deliveries.
//!
//! Header format: `t=<unix seconds>,v1=<hex signature>[,v1=...]`, where each
//! signature is `HMAC-SHA256("<t>.<body>", secret)`. Several `v1` entries may
//! be present while a signing key is being rolled.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance between the signed timestamp and now.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header has no timestamp")]
    MissingTimestamp,

    #[error("signature header has no v1 signature")]
    MissingSignature,

    #[error("signature timestamp {timestamp} outside tolerance of {tolerance}s")]
    OutsideTolerance { timestamp: i64, tolerance: i64 },

    #[error("no signature matches the payload")]
    Mismatch,

    #[error("invalid signing key")]
    InvalidKey,
}

/// Parsed `t=...,v1=...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

impl SignatureHeader {
    pub fn parse(header: &str) -> Result<Self, SignatureError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => signatures.push(value.to_string()),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
        if signatures.is_empty() {
            return Err(SignatureError::MissingSignature);
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Compute the hex signature for `body` signed at `timestamp`.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Format a header the way the sender does. Used by tests and tooling.
pub fn signature_header(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
    Ok(format!("t={},v1={}", timestamp, sign_payload(secret, timestamp, body)?))
}

/// Verify a webhook signature header against `body` using constant-time
/// comparison.
pub fn verify_webhook_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let parsed = SignatureHeader::parse(header)?;

    let outside = now
        .checked_sub(parsed.timestamp)
        .map_or(true, |drift| drift.unsigned_abs() > tolerance_secs.max(0) as u64);
    if outside {
        return Err(SignatureError::OutsideTolerance {
            timestamp: parsed.timestamp,
            tolerance: tolerance_secs,
        });
    }

    let expected = sign_payload(secret, parsed.timestamp, body)?;
    let expected_bytes = expected.as_bytes();

    let matched = parsed.signatures.iter().any(|candidate| {
        let candidate = candidate.as_bytes();
        candidate.len() == expected_bytes.len() && bool::from(expected_bytes.ct_eq(candidate))
    });

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}
