//! HMAC-SHA256 signatures shared by both confirmation paths.
//!
//! The webhook path signs the raw event body; the client path signs a
//! canonical string rebuilt from the order/payment identifiers. Verification
//! is constant-time via `Mac::verify_slice`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Sign arbitrary bytes, returning the provider's `sha256=<hex>` form.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take any size key");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a hex signature (with or without the `sha256=` prefix) over
/// `payload`. Constant-time on the MAC comparison.
pub fn verify(secret: &str, payload: &[u8], signature: &str) -> bool {
    let hex_part = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take any size key");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Canonical string the client-confirmation path signs:
/// `order_id|intent_id|status`.
pub fn client_payload(order_id: &str, intent_id: &str, status: &str) -> String {
    format!("{order_id}|{intent_id}|{status}")
}
