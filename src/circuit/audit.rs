//! Signed audit comments.
//!
//! Every acquisition leaves a comment carrying a machine-readable header and
//! an HMAC over `{trace, reason, timestamp, hop}`, so the hop history on an
//! issue can be checked for tampering.

use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use serde::Serialize;
use sha2::Sha256;

use crate::error::{GovernorError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const LOCK_MARKER: &str = "Lock acquired at";
pub const SIGNATURE_LEN: usize = 16;

const BRAND: &str = "autofix";

#[derive(Serialize)]
struct SignedPayload<'a> {
    trace: &'a str,
    reason: &'a str,
    timestamp: &'a str,
    hop: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub hop: u32,
    pub trace: String,
    pub reason: String,
    pub timestamp: String,
    pub signature: String,
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// First 16 hex chars of HMAC-SHA256 over the JSON payload.
pub fn sign(secret: &str, trace: &str, reason: &str, timestamp: &str, hop: u32) -> Result<String> {
    let payload = serde_json::to_vec(&SignedPayload {
        trace,
        reason,
        timestamp,
        hop,
    })?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GovernorError::Config(format!("invalid signature secret: {e}")))?;
    mac.update(&payload);
    let mut digest = hex::encode(mac.finalize().into_bytes());
    digest.truncate(SIGNATURE_LEN);
    Ok(digest)
}

pub fn verify(secret: &str, record: &AuditRecord) -> Result<bool> {
    let expected = sign(
        secret,
        &record.trace,
        &record.reason,
        &record.timestamp,
        record.hop,
    )?;
    Ok(expected == record.signature)
}

pub fn metadata_comment(
    secret: &str,
    hop: u32,
    max_hops: u32,
    trace: &str,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<String> {
    let ts = format_timestamp(at);
    let signature = sign(secret, trace, reason, &ts, hop)?;
    Ok(format!(
        "<!-- {BRAND}-meta -->\n\
         [{BRAND}] hop={hop} trace={trace} reason=\"{reason}\" ts={ts} signature=sha256:{signature}\n\
         <!-- /{BRAND}-meta -->\n\n\
         **Attempt {hop} of {max_hops}**\n\
         - Trace: `{trace}`\n\
         - Reason: {reason}\n\
         - Timestamp: {ts}\n\n\
         ---\n\
         *Automated by {BRAND}*"
    ))
}

/// Audit comment plus the lock marker used to age the soft lock.
pub fn lock_comment(
    secret: &str,
    hop: u32,
    max_hops: u32,
    trace: &str,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<String> {
    let meta = metadata_comment(secret, hop, max_hops, trace, reason, at)?;
    Ok(format!("{meta}\n\n{LOCK_MARKER} {}", format_timestamp(at)))
}

pub fn trip_comment(max_hops: u32, reason: &str) -> String {
    format!(
        "## Circuit Breaker Tripped\n\n\
         Automated fixing has stopped after {max_hops} attempts.\n\n\
         **Reason:** {reason}\n\n\
         **Next steps:**\n\
         1. Review the previous attempts above\n\
         2. Fix the issue manually, or\n\
         3. Reset the breaker to allow new automated attempts\n\n\
         ---\n\
         *Automated by {BRAND}*"
    )
}

pub fn reset_comment(at: DateTime<Utc>) -> String {
    format!(
        "## Circuit Breaker Reset\n\n\
         Hop counter reset to 0 at {}. Automated fixes may run again.\n\n\
         ---\n\
         *Automated by {BRAND}*",
        format_timestamp(at)
    )
}

static META_LINE: OnceLock<Regex> = OnceLock::new();

fn meta_line() -> &'static Regex {
    META_LINE.get_or_init(|| {
        Regex::new(
            r#"\[autofix\] hop=(\d+) trace=(\S*) reason="([^"]*)" ts=(\S+) signature=sha256:([0-9a-f]+)"#,
        )
        .unwrap()
    })
}

pub fn parse_metadata(comment: &str) -> Option<AuditRecord> {
    let caps = meta_line().captures(comment)?;
    Some(AuditRecord {
        hop: caps[1].parse().ok()?,
        trace: caps[2].to_string(),
        reason: caps[3].to_string(),
        timestamp: caps[4].to_string(),
        signature: caps[5].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(format_timestamp(at()), "2025-03-01T09:00:00.000Z");
    }

    #[test]
    fn test_signature_is_stable_and_keyed() {
        let ts = format_timestamp(at());
        let a = sign("secret", "run-1", "initial attempt", &ts, 1).unwrap();
        let b = sign("secret", "run-1", "initial attempt", &ts, 1).unwrap();
        let c = sign("other", "run-1", "initial attempt", &ts, 1).unwrap();
        assert_eq!(a.len(), SIGNATURE_LEN);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_lock_comment_round_trips_through_parser() {
        let body = lock_comment("secret", 2, 3, "run-9", "retry", at()).unwrap();
        assert!(body.contains("**Attempt 2 of 3**"));
        assert!(body.ends_with("Lock acquired at 2025-03-01T09:00:00.000Z"));

        let record = parse_metadata(&body).unwrap();
        assert_eq!(record.hop, 2);
        assert_eq!(record.trace, "run-9");
        assert!(verify("secret", &record).unwrap());

        let tampered = AuditRecord {
            hop: 1,
            ..record
        };
        assert!(!verify("secret", &tampered).unwrap());
    }

    #[test]
    fn test_parse_ignores_plain_comments() {
        assert!(parse_metadata("Thanks, looking into it").is_none());
    }
}
