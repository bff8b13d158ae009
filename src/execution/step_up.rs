//! Step-up tokens
//!
//! A step-up token is `hex(HMAC-SHA256(secret, "{user_id}:{quote_id}"))`,
//! issued by the second-factor flow for one specific quote.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::core_types::{QuoteId, UserId};

type HmacSha256 = Hmac<Sha256>;

fn message(user_id: UserId, quote_id: QuoteId) -> String {
    format!("{user_id}:{quote_id}")
}

/// Issue a token. Returns `None` when no secret is configured.
pub fn issue(secret: &str, user_id: UserId, quote_id: QuoteId) -> Option<String> {
    if secret.is_empty() {
        return None;
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message(user_id, quote_id).as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a presented token
pub fn verify(secret: &str, user_id: UserId, quote_id: QuoteId, token: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(presented) = hex::decode(token.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message(user_id, quote_id).as_bytes());
    mac.verify_slice(&presented).is_ok()
}
