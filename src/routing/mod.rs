//! Tier routing from stack-trace shape.
//!
//! Shallow single-file traces go to the cheap tier, moderate ones to the
//! reviewed tier, and deep, fileless or sensitive ones to the strongest model.

mod sensitive;

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use sensitive::SensitivePaths;

use crate::config::RoutingConfig;
use crate::error::{GovernorError, Result};

pub const FAST_MODEL: &str = "deepseek-v3.2-exp";
pub const STRONG_MODEL: &str = "gpt-5";

const PATH_ANCHORS: &[&str] = &[
    "manifest.json",
    "background/",
    "shared/",
    "config/",
    "homeostat/",
    "src/",
    "content/",
    "scripts/",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    One,
    Two,
    Three,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::One, Tier::Two, Tier::Three];

    pub fn number(&self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
        }
    }

    /// Model attempts allowed at this tier before giving up.
    pub fn default_attempts(&self) -> u32 {
        match self {
            Self::Three => 1,
            _ => 2,
        }
    }
}

impl TryFrom<u8> for Tier {
    type Error = GovernorError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            other => Err(GovernorError::Config(format!("Unknown tier: {other}"))),
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> Self {
        tier.number()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier{}", self.number())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub tier: Tier,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    pub attempts: u32,
}

impl Route {
    pub fn for_tier(tier: Tier) -> Self {
        let (model, reviewer) = match tier {
            Tier::One => (FAST_MODEL, None),
            Tier::Two => (FAST_MODEL, Some(STRONG_MODEL.to_string())),
            Tier::Three => (STRONG_MODEL, None),
        };
        Self {
            tier,
            model: model.to_string(),
            reviewer,
            attempts: tier.default_attempts(),
        }
    }
}

static FRAME_FILE: OnceLock<Regex> = OnceLock::new();

fn frame_file() -> &'static Regex {
    FRAME_FILE.get_or_init(|| Regex::new(r"(?:at\s+[^()]*\()?([^\s():]+):\d+:\d+").unwrap())
}

fn anchor_path(raw: &str) -> String {
    let trimmed = raw
        .trim()
        .trim_start_matches(['(', '\'', '"'])
        .trim_end_matches([')', '\'', '"'])
        .trim()
        .replace('\\', "/");

    let mut file = trimmed.as_str();
    if file.len() >= 3
        && file.as_bytes()[0].is_ascii_alphabetic()
        && file[1..].starts_with(":/")
    {
        file = &file[3..];
    }
    file = file.strip_prefix("./").unwrap_or(file);
    file = file.strip_prefix('/').unwrap_or(file);

    for anchor in PATH_ANCHORS {
        if let Some(idx) = file.find(anchor) {
            return file[idx..].to_string();
        }
    }
    file.to_string()
}

/// Unique source files referenced by a stack trace, in order of appearance,
/// anchored at the first known project root.
pub fn extract_files(stack: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for line in stack.lines() {
        let Some(caps) = frame_file().captures(line) else {
            continue;
        };
        let file = anchor_path(&caps[1]);
        if !file.is_empty() && !files.contains(&file) {
            files.push(file);
        }
    }
    files
}

pub struct Router {
    config: RoutingConfig,
    sensitive: SensitivePaths,
}

impl Router {
    pub fn new(config: RoutingConfig) -> Result<Self> {
        let sensitive = SensitivePaths::new(&config.extra_sensitive_patterns)?;
        Ok(Self { config, sensitive })
    }

    pub fn select(&self, stack: &str) -> Route {
        if let Some(forced) = self.config.force_tier {
            let tier = Tier::try_from(forced).unwrap_or(Tier::Three);
            debug!(%tier, "Routing forced by configuration");
            return Route::for_tier(tier);
        }

        let files = extract_files(stack);
        let tier = if stack.trim().is_empty() || files.is_empty() {
            Tier::Three
        } else if files.iter().any(|f| self.sensitive.is_sensitive(f)) {
            Tier::Three
        } else {
            let depth = stack.split('\n').count();
            if depth <= self.config.shallow_depth && files.len() == 1 {
                Tier::One
            } else if depth < self.config.medium_depth && files.len() <= self.config.medium_max_files {
                Tier::Two
            } else {
                Tier::Three
            }
        };

        debug!(%tier, files = files.len(), "Selected routing tier");
        Route::for_tier(tier)
    }
}
