//! Classification of upstream API error responses
//!
//! Metered APIs answer 429 for two different reasons: a short per-second or
//! per-minute throttle (retry shortly) and an exhausted plan or credit budget
//! (stop calling until the budget resets). Only the latter is a quota
//! failure; it defers the job instead of burning one of its attempts.

use common::ErrorClass;

/// Body fragments that indicate the plan/credit budget is exhausted.
const QUOTA_PATTERNS: &[&str] = &[
    "quota",
    "credits",
    "usage limit",
    "plan limit",
    "monthly limit",
    "limit for your plan",
];

/// Classify a 429 response body as quota exhaustion or a transient throttle.
pub fn classify_429(body: &str) -> ErrorClass {
    let lower = body.to_lowercase();
    if QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
        ErrorClass::QuotaExceeded
    } else {
        ErrorClass::Transient
    }
}

/// Classify an upstream error by HTTP status and response body.
///
/// 402 and quota-flavoured 429s are `QuotaExceeded`; 401/403 are
/// `TerminalAuth` (the credential no longer works); everything else,
/// including 408 and 5xx, is `Transient`.
pub fn classify_status(status: u16, body: &str) -> ErrorClass {
    match status {
        429 => classify_429(body),
        402 => ErrorClass::QuotaExceeded,
        401 | 403 => ErrorClass::TerminalAuth,
        _ => ErrorClass::Transient,
    }
}
