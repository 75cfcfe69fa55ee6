//! Admission decisions for rate limit checks.
//!
//! The policy is a pure function of a [`WindowRecord`] snapshot, the
//! configured maximum, and the current time. All I/O lives in the store and
//! the middleware; nothing here can fail.

use serde::Serialize;

use crate::store::WindowRecord;

/// Outcome of checking one request against a window record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request that produced the record is allowed through.
    pub admitted: bool,
    /// The configured maximum hits per window.
    pub limit: u64,
    /// Hits left in the current window, floored at zero.
    pub remaining: u64,
    /// When the window resets, in whole epoch seconds (rounded up).
    pub reset_at_secs: i64,
    /// Seconds until the caller may retry; present only on rejection.
    pub retry_after_secs: Option<u64>,
}

/// Decide whether the request that produced `record` is admitted.
///
/// The boundary is inclusive: the hit that brings the count to exactly
/// `max_hits` is still admitted, the next one is not. A `max_hits` of zero
/// rejects everything, since every record carries at least one hit.
pub fn evaluate(record: &WindowRecord, max_hits: u64, now_ms: i64) -> Decision {
    let admitted = record.hit_count <= max_hits;

    let retry_after_secs = if admitted {
        None
    } else {
        let wait_ms = (record.window_reset_at - now_ms).max(0) as u64;
        Some(wait_ms.div_ceil(1_000))
    };

    Decision {
        admitted,
        limit: max_hits,
        remaining: max_hits.saturating_sub(record.hit_count),
        // Manual rounding: div_ceil on signed integers is not yet stable.
        reset_at_secs: (record.window_reset_at + 999) / 1_000,
        retry_after_secs,
    }
}
