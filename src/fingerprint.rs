//! Stable error identity.
//!
//! Two occurrences of the same defect that differ only in dynamic values
//! (hashes, ids, dates, counters) map to the same [`Fingerprint`].

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const UNKNOWN: &str = "unknown";
const MESSAGE_HASH_LEN: usize = 8;
const ID_LEN: usize = 12;

/// Raw error as reported by the issue parser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub stack: String,
}

impl RawError {
    pub fn new(
        error_type: impl Into<String>,
        message: impl Into<String>,
        stack: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            stack: stack.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub id: String,
    pub error_type: String,
    pub file_path: String,
    pub top_frame: String,
    pub message_hash: String,
    pub signature: String,
}

static NORMALIZERS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
static FRAME_PATTERN: OnceLock<Regex> = OnceLock::new();
static PATH_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Replacement order matters: hashes before UUIDs before bare numbers.
fn normalizers() -> &'static [(Regex, &'static str)] {
    NORMALIZERS.get_or_init(|| {
        [
            (r"[A-Fa-f0-9]{32}", "HASH"),
            (r"[A-Fa-f0-9-]{36}", "UUID"),
            (r"[0-9]{4}-[0-9]{2}-[0-9]{2}", "DATE"),
            (r"[0-9]{2}:[0-9]{2}:[0-9]{2}", "TIME"),
            (r"\b[0-9]+\b", "N"),
        ]
        .into_iter()
        .map(|(pattern, token)| (Regex::new(pattern).unwrap(), token))
        .collect()
    })
}

/// `at fn (path:line:col)`
fn frame_pattern() -> &'static Regex {
    FRAME_PATTERN.get_or_init(|| Regex::new(r"at \S+ \(([^:]+):(\d+):(\d+)\)").unwrap())
}

/// Bare `/path:line:col`
fn path_pattern() -> &'static Regex {
    PATH_PATTERN.get_or_init(|| Regex::new(r"(/[\w./-]+):(\d+):(\d+)").unwrap())
}

pub fn normalize_message(message: &str) -> String {
    normalizers()
        .iter()
        .fold(message.to_string(), |acc, (re, token)| {
            re.replace_all(&acc, *token).into_owned()
        })
}

pub fn extract_file_path(stack: &str) -> String {
    if let Some(caps) = frame_pattern().captures(stack) {
        return caps[1].to_string();
    }
    if let Some(caps) = path_pattern().captures(stack) {
        return caps[1].to_string();
    }
    UNKNOWN.to_string()
}

fn sha256_prefix(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(len);
    hex
}

/// Compute a fingerprint. Pure and total: never fails, any input yields one.
pub fn fingerprint(error: &RawError) -> Fingerprint {
    let file_path = extract_file_path(&error.stack);
    let top_frame = error
        .stack
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .unwrap_or(UNKNOWN)
        .to_string();

    let message_hash = sha256_prefix(&normalize_message(&error.message), MESSAGE_HASH_LEN);
    let signature = format!("{}:{}:{}", error.error_type, file_path, message_hash);
    let id = sha256_prefix(&signature, ID_LEN);

    Fingerprint {
        id,
        error_type: error.error_type.clone(),
        file_path,
        top_frame,
        message_hash,
        signature,
    }
}
