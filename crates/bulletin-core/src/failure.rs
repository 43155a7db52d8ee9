//! Sanitizing failure reasons before they leave the platform.

/// Reasons that are safe to surface verbatim to users.
pub const SAFE_FAILURE_REASONS: [&str; 6] = [
    "insufficient resources",
    "missing app bits download uri",
    "missing app id",
    "missing task id",
    "no compiler defined for requested stack",
    "cell mismatch",
];

/// Replacement for any reason not on the whitelist.
pub const STAGING_FAILED: &str = "staging failed";

/// Map a placement or staging failure reason to its user-visible form.
///
/// Records keep the raw reason; only outward-facing messages go through
/// this.
pub fn sanitize_failure_reason(reason: &str) -> &str {
    SAFE_FAILURE_REASONS
        .iter()
        .find(|safe| **safe == reason)
        .copied()
        .unwrap_or(STAGING_FAILED)
}
