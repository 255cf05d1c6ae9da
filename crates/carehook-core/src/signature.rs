//! HMAC-SHA256 request signing.
//!
//! The signature is computed over the raw body bytes exactly as sent, using
//! the subscription's signing secret, and transmitted hex-encoded in
//! [`SIGNATURE_HEADER`]. Receivers must verify it before trusting the payload.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded HMAC-SHA256 of the body.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Compute the hex-encoded HMAC-SHA256 of `body` under `secret`.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex-encoded signature in constant time.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
