//! Handle rate limiting headers.
//!
//! Pure extraction of pacing metadata from a completed exchange. Nothing here
//! mutates bucket state; the dispatcher feeds the parsed result into the
//! owning bucket.

use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use strum::{Display, EnumString};

use super::bucket::BucketId;

const HEADER_GLOBAL: &str = "x-ratelimit-global";
const HEADER_SCOPE: &str = "x-ratelimit-scope";
const HEADER_BUCKET: &str = "x-ratelimit-bucket";
const HEADER_LIMIT: &str = "x-ratelimit-limit";
const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
const HEADER_RETRY_AFTER: &str = "retry-after";

/// Which scope a throttled response applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RateLimitScope {
    /// Limit applies to the authenticated user
    User,
    /// Limit applies platform-wide
    Global,
    /// Limit applies to a resource shared between users
    Shared,
}

/// Diagnostics carried in the structured body of a throttled response.
///
/// Used only for logging; pacing is derived from headers, never from the
/// body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThrottleNotice {
    /// Human-readable message from the server
    pub message: String,
    /// Platform error code, if the server sent one
    #[serde(default)]
    pub code: Option<i64>,
}

/// Pacing metadata extracted from a single completed exchange
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitInfo {
    /// Whether this exchange hit the platform-wide throttle
    pub is_global: bool,
    /// Scope the limit applies to, if the server named one
    pub scope: Option<RateLimitScope>,
    /// Real identity of the bucket this route belongs to.
    /// `None` on global throttles, which carry no per-bucket identity.
    pub bucket_id: Option<BucketId>,
    /// Requests allowed per window
    pub limit: u32,
    /// Requests remaining in the current window, clamped to zero
    pub remaining: u32,
    /// Delay until the window resets, measured from receipt of the response
    pub reset_after: Duration,
    /// Diagnostics from a 429 body, if one was present
    pub throttle: Option<ThrottleNotice>,
}

/// Extract pacing metadata from response headers (and, for throttled
/// responses, the structured body).
///
/// Returns `None` when the exchange carried no rate-limit identity at all —
/// neither a global flag nor a bucket id — in which case there is nothing to
/// apply.
pub(crate) fn parse_rate_limit(
    status: StatusCode,
    headers: &HeaderMap,
    body: Option<&str>,
) -> Option<RateLimitInfo> {
    let is_global = header_str(headers, HEADER_GLOBAL)
        .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1");
    let scope = header_str(headers, HEADER_SCOPE).and_then(|s| s.parse().ok());
    let reset_after = reset_delay(headers);
    let throttle = throttle_notice(status, body);

    if is_global {
        return Some(RateLimitInfo {
            is_global,
            scope,
            bucket_id: None,
            limit: 0,
            remaining: 0,
            reset_after,
            throttle,
        });
    }

    let bucket_id = header_str(headers, HEADER_BUCKET).map(BucketId::from)?;

    Some(RateLimitInfo {
        is_global,
        scope,
        bucket_id: Some(bucket_id),
        limit: header_u32(headers, HEADER_LIMIT).unwrap_or(0),
        remaining: header_u32(headers, HEADER_REMAINING).unwrap_or(0),
        reset_after,
        throttle,
    })
}

/// Conservative reset delay: the larger of `Reset-After` and `Retry-After`
fn reset_delay(headers: &HeaderMap) -> Duration {
    let reset_after = header_f64(headers, HEADER_RESET_AFTER).unwrap_or(0.0);
    let retry_after = header_f64(headers, HEADER_RETRY_AFTER).unwrap_or(0.0);
    Duration::from_secs_f64(reset_after.max(retry_after).max(0.0))
}

/// Diagnostics from the body of a throttled response, if it is structured
fn throttle_notice(status: StatusCode, body: Option<&str>) -> Option<ThrottleNotice> {
    if status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    let body = body?;
    if !body.starts_with('{') {
        return None;
    }
    serde_json::from_str(body).ok()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    // Servers under clock skew have been seen reporting values just below
    // zero; clamp before any pacing decision sees them.
    let value = header_str(headers, name)?.parse::<i64>().ok()?;
    Some(u32::try_from(value.max(0)).unwrap_or(u32::MAX))
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    header_str(headers, name)?.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_parse_bucket_headers() {
        let headers = headers(&[
            ("x-ratelimit-bucket", "abcd1234"),
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "3"),
            ("x-ratelimit-reset-after", "2.5"),
            ("x-ratelimit-scope", "user"),
        ]);
        let info = parse_rate_limit(StatusCode::OK, &headers, None).unwrap();
        assert!(!info.is_global);
        assert_eq!(info.bucket_id.unwrap().as_str(), "abcd1234");
        assert_eq!(info.limit, 5);
        assert_eq!(info.remaining, 3);
        assert_eq!(info.reset_after, Duration::from_secs_f64(2.5));
        assert_eq!(info.scope, Some(RateLimitScope::User));
    }

    #[test]
    fn test_parse_no_rate_limit_identity() {
        let headers = headers(&[("content-type", "application/json")]);
        assert_eq!(parse_rate_limit(StatusCode::OK, &headers, None), None);
    }

    #[test]
    fn test_parse_global_throttle() {
        let headers = headers(&[
            ("x-ratelimit-global", "true"),
            ("retry-after", "4"),
            ("x-ratelimit-scope", "global"),
        ]);
        let info = parse_rate_limit(StatusCode::TOO_MANY_REQUESTS, &headers, None).unwrap();
        assert!(info.is_global);
        assert_eq!(info.bucket_id, None);
        assert_eq!(info.reset_after, Duration::from_secs(4));
        assert_eq!(info.scope, Some(RateLimitScope::Global));
    }

    #[test]
    fn test_reset_delay_is_conservative() {
        // Reset-After and Retry-After can disagree; the larger wins
        let headers = headers(&[
            ("x-ratelimit-bucket", "b"),
            ("x-ratelimit-reset-after", "1.5"),
            ("retry-after", "10"),
        ]);
        let info = parse_rate_limit(StatusCode::OK, &headers, None).unwrap();
        assert_eq!(info.reset_after, Duration::from_secs(10));
    }

    #[test]
    fn test_negative_remaining_clamped() {
        let headers = headers(&[
            ("x-ratelimit-bucket", "b"),
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "-1"),
        ]);
        let info = parse_rate_limit(StatusCode::OK, &headers, None).unwrap();
        assert_eq!(info.remaining, 0);
    }

    #[test]
    fn test_throttle_notice_from_structured_body() {
        let headers = headers(&[("x-ratelimit-bucket", "b"), ("retry-after", "1")]);
        let body = r#"{"message": "You are being rate limited.", "code": 20016}"#;
        let info = parse_rate_limit(StatusCode::TOO_MANY_REQUESTS, &headers, Some(body)).unwrap();
        let notice = info.throttle.unwrap();
        assert_eq!(notice.message, "You are being rate limited.");
        assert_eq!(notice.code, Some(20016));
    }

    #[test]
    fn test_throttle_notice_ignored_on_success() {
        let headers = headers(&[("x-ratelimit-bucket", "b")]);
        let body = r#"{"message": "ok", "code": 0}"#;
        let info = parse_rate_limit(StatusCode::OK, &headers, Some(body)).unwrap();
        assert_eq!(info.throttle, None);
    }

    #[test]
    fn test_unstructured_429_body_has_no_notice() {
        let headers = headers(&[("x-ratelimit-bucket", "b")]);
        let info =
            parse_rate_limit(StatusCode::TOO_MANY_REQUESTS, &headers, Some("slow down")).unwrap();
        assert_eq!(info.throttle, None);
    }
}
