//! Canary tokens: per-message secrets whose appearance in worker output is
//! proof of prompt leakage.
//!
//! A token is 128 bits from the OS RNG under a fixed prefix. The prefix
//! keeps redaction a plain substring pass and makes tokens easy to find in
//! logs; knowing the prefix does not help an attacker, who would have to
//! reproduce the random half to forge or filter one.

use rand::rngs::OsRng;
use rand::RngCore;

/// Prefix identifying canary tokens.
pub const CANARY_PREFIX: &str = "axc-";

/// Fixed replacement for a response that leaked its canary.
pub const REDACTION_TEXT: &str = "[Response redacted: canary token leaked]";

/// Replacement for individual scrubbed occurrences.
const SCRUB_MARKER: &str = "[redacted]";

/// Mint a fresh token: prefix plus 32 hex chars (128 bits of entropy).
pub fn mint() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("{CANARY_PREFIX}{}", hex::encode(bytes))
}

/// The marker appended to enqueued content so the token rides into the
/// worker's context.
pub fn marker(token: &str) -> String {
    format!("[[canary:{token}]]")
}

/// Exact-match leak check.
pub fn leaked(output: &str, token: &str) -> bool {
    output.contains(token)
}

/// Replace every occurrence of the token, returning the scrubbed text and
/// the number of occurrences rewritten.
pub fn scrub(output: &str, token: &str) -> (String, usize) {
    let count = output.matches(token).count();
    if count == 0 {
        return (output.to_string(), 0);
    }
    (output.replace(token, SCRUB_MARKER), count)
}
