//! RPC failure classification
//!
//! Splits call failures into rate-limit signals (which feed the scheduler's
//! backoff loop) and everything else (plain transient failures).

use alloy_transport::{RpcError, TransportError, TransportErrorKind};

/// JSON-RPC / HTTP codes that mean "slow down"
pub const RATE_LIMIT_CODES: &[i64] = &[429, -32005];

/// Lowercase message fragments that mean "slow down"
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "request limit",
    "exceeded the quota",
    "throttl",
];

/// Prefixes a rate-limit code is reported under, e.g. `HTTP error 429`
const CODE_PREFIXES: &[&str] = &["http error ", "status ", "code "];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Endpoint signalled overload
    RateLimited,
    /// Any other network, RPC or decode failure
    Transient,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::RateLimited => write!(f, "rate-limited"),
            FailureKind::Transient => write!(f, "transient"),
        }
    }
}

/// Error code carried by an alloy transport error, if any
fn transport_code(err: &TransportError) -> Option<i64> {
    if let Some(payload) = err.as_error_resp() {
        return Some(payload.code);
    }
    match err {
        RpcError::Transport(TransportErrorKind::HttpError(http)) => Some(http.status as i64),
        _ => None,
    }
}

/// Does a message look like a rate-limit response?
pub fn is_rate_limit_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    RATE_LIMIT_PATTERNS.iter().any(|p| lowered.contains(p))
        || RATE_LIMIT_CODES.iter().any(|code| {
            CODE_PREFIXES
                .iter()
                .any(|prefix| contains_code(&lowered, &format!("{}{}", prefix, code)))
        })
}

/// `needle` present and not followed by another digit (`code 429` but not `code 4290`)
fn contains_code(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(at, _)| {
        !haystack[at + needle.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}

/// Classify a failed call by walking its error chain
pub fn classify(err: &eyre::Report) -> FailureKind {
    if let Some(transport) = err.downcast_ref::<TransportError>() {
        if let Some(code) = transport_code(transport) {
            if RATE_LIMIT_CODES.contains(&code) {
                return FailureKind::RateLimited;
            }
        }
    }

    if err.chain().any(|cause| is_rate_limit_message(&cause.to_string())) {
        FailureKind::RateLimited
    } else {
        FailureKind::Transient
    }
}
