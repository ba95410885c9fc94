//! Minimal issue parser and sanitizer.
//!
//! Issue bodies use `key: value` lines; everything after `stack:` is the
//! stack trace.

use std::sync::OnceLock;

use regex::Regex;

use autofix_governor::orchestrator::{
    IssueParser, ParseOutcome, ParsedIssue, Sanitized, Sanitizer,
};
use autofix_governor::tracker::Issue;

pub struct LineParser;

impl IssueParser for LineParser {
    fn parse(&self, issue: &Issue) -> ParseOutcome {
        let mut parsed = ParsedIssue::default();
        let mut lines = issue.body.lines();
        let mut stack = Vec::new();

        for line in lines.by_ref() {
            if line.trim() == "stack:" {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                let value = value.trim().to_string();
                match key.trim() {
                    "type" => parsed.error_type = value,
                    "message" => parsed.error_message = value,
                    "fingerprint" => parsed.fingerprint = Some(value),
                    "extension" => parsed.extension = value,
                    _ => {}
                }
            }
        }
        stack.extend(lines.map(str::to_string));
        parsed.stack_trace = stack.join("\n").trim().to_string();

        let mut errors = Vec::new();
        if parsed.error_type.is_empty() {
            errors.push("Invalid issue title format".to_string());
        }
        if parsed.stack_trace.is_empty() {
            errors.push("Missing required field: stackTrace".to_string());
        }
        ParseOutcome { parsed, errors }
    }
}

static EMAIL: OnceLock<Regex> = OnceLock::new();

/// Replaces e-mail addresses, reporting one `email` redaction per hit.
pub struct EmailSanitizer;

impl Sanitizer for EmailSanitizer {
    fn sanitize(&self, text: &str) -> Sanitized {
        let re = EMAIL.get_or_init(|| Regex::new(r"[\w.+-]+@[\w-]+\.[\w.]+").unwrap());
        let hits = re.find_iter(text).count();
        Sanitized {
            text: re.replace_all(text, "[REDACTED_EMAIL]").into_owned(),
            redactions: vec!["email".to_string(); hits],
        }
    }
}

pub fn body(error_type: &str, message: &str, stack: &str) -> String {
    format!("type: {error_type}\nmessage: {message}\nstack:\n{stack}")
}

pub fn shallow_body() -> String {
    body(
        "TypeError",
        "Cannot read properties of undefined (reading 'id')",
        "at handler (src/content/handler.ts:10:5)",
    )
}
