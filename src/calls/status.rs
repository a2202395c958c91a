//! SIP status codes as the dialer shows them.

/// Human-readable reason for a SIP final status code.
pub fn status_reason(code: u16) -> &'static str {
    match code {
        400 => "Bad request",
        401 | 407 => "Authentication required",
        403 => "Forbidden",
        404 => "Number not found",
        408 => "Request timeout",
        480 => "Temporarily unavailable",
        484 => "Address incomplete",
        486 => "Busy",
        487 => "Call cancelled",
        488 => "Not acceptable here",
        500 => "Server error",
        502 => "Bad gateway",
        503 => "Service unavailable",
        504 => "Server timeout",
        600 => "Busy everywhere",
        603 => "Declined",
        604 => "Does not exist anywhere",
        100..=199 => "Call in progress",
        200..=299 => "Call completed",
        300..=399 => "Call redirected",
        400..=499 => "Call failed",
        500..=599 => "Server failure",
        600..=699 => "Call rejected",
        _ => "Unknown status",
    }
}

/// Reason reported with an `Ended` event: the mapped status reason when a
/// code is known, otherwise whatever the far end said, otherwise `fallback`.
pub fn end_reason(code: Option<u16>, remote_reason: Option<&str>, fallback: &str) -> String {
    match (code, remote_reason) {
        (Some(code), _) if code >= 300 => status_reason(code).to_owned(),
        (_, Some(reason)) if !reason.is_empty() => reason.to_owned(),
        _ => fallback.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_codes() {
        assert_eq!(status_reason(486), "Busy");
        assert_eq!(status_reason(487), "Call cancelled");
        assert_eq!(status_reason(603), "Declined");
        assert_eq!(status_reason(404), "Number not found");
        assert_eq!(status_reason(401), status_reason(407));
        assert_eq!(status_reason(503), "Service unavailable");
    }

    #[test]
    fn test_unlisted_codes_fall_back_to_class() {
        assert_eq!(status_reason(183), "Call in progress");
        assert_eq!(status_reason(302), "Call redirected");
        assert_eq!(status_reason(415), "Call failed");
        assert_eq!(status_reason(599), "Server failure");
        assert_eq!(status_reason(699), "Call rejected");
        assert_eq!(status_reason(42), "Unknown status");
    }

    #[test]
    fn test_end_reason_prefers_mapped_code() {
        assert_eq!(end_reason(Some(486), Some("Busy Here"), "Hung up"), "Busy");
        assert_eq!(end_reason(Some(200), Some("BYE"), "Hung up"), "BYE");
        assert_eq!(end_reason(None, None, "Hung up"), "Hung up");
        assert_eq!(end_reason(None, Some(""), "Remote hangup"), "Remote hangup");
    }
}
