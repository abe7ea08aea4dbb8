use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

type HmacSha256 = Hmac<Sha256>;

/// Headers added to a signed webhook request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    pub signature: (String, String),
    pub timestamp: (String, String),
}

/// Sign an outgoing webhook body with the integration secret.
pub fn build_signature_headers(secret: &str, body: &[u8]) -> SignatureHeaders {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string();
    let signature = compute_signature(secret.as_bytes(), body, Some(&timestamp));

    SignatureHeaders {
        signature: (SIGNATURE_HEADER.to_string(), format!("sha256={signature}")),
        timestamp: (TIMESTAMP_HEADER.to_string(), timestamp),
    }
}

fn signed_mac(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> Option<HmacSha256> {
    // HMAC accepts keys of any length; the error arm is unreachable.
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    if let Some(ts) = timestamp {
        mac.update(ts.as_bytes());
        mac.update(b".");
    }
    mac.update(payload);
    Some(mac)
}

/// Hex HMAC-SHA256 over `"{timestamp}.{payload}"`, or the bare payload.
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> String {
    signed_mac(secret, payload, timestamp)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Verify a received signature. Accepts an optional `sha256=` prefix.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    timestamp: Option<&str>,
    signature: &str,
) -> bool {
    let signature_hex = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    signed_mac(secret, payload, timestamp).is_some_and(|mac| mac.verify_slice(&signature).is_ok())
}

pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    now_secs >= timestamp_secs && now_secs - timestamp_secs <= max_age_secs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MissingTimestamp,
    InvalidTimestamp,
    StaleTimestamp,
    InvalidSignature,
}

/// Check a delivery on the receiving side in one call.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
    max_age_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut signature = None;
    let mut timestamp = None;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            signature = Some(value);
        } else if name.eq_ignore_ascii_case(TIMESTAMP_HEADER) {
            timestamp = Some(value);
        }
    }

    let signature = signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp_str = timestamp.ok_or(VerificationError::MissingTimestamp)?;
    let timestamp = timestamp_str
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(secret, payload, Some(timestamp_str), signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
