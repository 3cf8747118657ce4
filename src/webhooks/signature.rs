//! Delivery payload signing using HMAC-SHA256.
//!
//! Outbound deliveries are signed with the webhook's secret over
//! `{timestamp}.{body}` and the signature travels in the `X-Signature`
//! header as `sha256=<hex>`. Binding the timestamp into the MAC input lets
//! receivers reject replayed payloads without any additional state.
//!
//! Verification accepts any of a set of secrets: after a secret rotation the
//! previous secret stays valid for a grace period so in-flight deliveries
//! signed with it are not dropped.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Computes the HMAC-SHA256 signature of a timestamped payload.
pub fn sign_payload(timestamp_ms: u64, body: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as an `X-Signature` header value (`sha256=<hex>`).
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Parses an `X-Signature` header value into raw bytes.
///
/// Returns `None` for malformed headers (missing prefix, invalid hex).
/// Never panics.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// Verifies a delivery signature against any of the given secrets.
///
/// Uses the HMAC library's constant-time comparison. Multiple secrets cover
/// the rotation grace window; an empty secret list always fails.
pub fn verify_signature<'a>(
    timestamp_ms: u64,
    body: &[u8],
    signature_header: &str,
    secrets: impl IntoIterator<Item = &'a [u8]>,
) -> bool {
    let Some(expected) = parse_signature_header(signature_header) else {
        return false;
    };

    secrets.into_iter().any(|secret| {
        let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
            return false;
        };
        mac.update(timestamp_ms.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    })
}
