//! Paths that always route to the most capable tier.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::Result;

const BUILTIN_PATTERNS: &[&str] = &[
    r"(?i)^manifest\.json$",
    r"(?i)(?:^|/)auth(?:-?helper)?\.(?:js|ts|mjs|cjs)$",
    r"(?i)(?:^|/)api-keys?\.(?:js|ts|mjs|cjs)$",
    r"(?i)(?:^|/)oauth\.(?:js|ts|mjs|cjs)$",
    r"(?i)(?:^|/)encryption\.(?:js|ts|mjs|cjs)$",
    r"(?i)(?:^|/)payment\.(?:js|ts|mjs|cjs)$",
    r"(?i)(?:^|/)stripe\.(?:js|ts|mjs|cjs)$",
    r"(?i)(?:^|/)user-data\.(?:js|ts|mjs|cjs)$",
    r"(?i)^config/secrets/",
    r"(?i)^shared/security/",
    r"(?i)(?:^|/)token-store\.(?:js|ts|mjs|cjs)$",
    r"(?i)(?:^|/)\.env(?:\.[^/]+)?$",
    r"(?i)(?:^|/)\.npmrc$",
    r"(?i)(?:^|/)\.aws/credentials$",
    r"(?i)(?:^|/)terraform/.*\.tf$",
    r"(?i)(?:^|/)k8s/.*(?:secret|secrets).*\.ya?ml$",
];

static BUILTIN: OnceLock<Vec<Regex>> = OnceLock::new();

fn builtin() -> &'static [Regex] {
    BUILTIN.get_or_init(|| {
        BUILTIN_PATTERNS
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect()
    })
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let path = path.strip_prefix("./").unwrap_or(&path);
    path.strip_prefix('/').unwrap_or(path).to_string()
}

/// Built-in sensitive-path rules plus any configured extras.
#[derive(Debug, Clone, Default)]
pub struct SensitivePaths {
    extra: Vec<Regex>,
}

impl SensitivePaths {
    pub fn new(extra_patterns: &[String]) -> Result<Self> {
        let extra = extra_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { extra })
    }

    pub fn is_sensitive(&self, path: &str) -> bool {
        let normalized = normalize(path);
        builtin()
            .iter()
            .chain(self.extra.iter())
            .any(|re| re.is_match(&normalized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_sensitive_paths() {
        let paths = SensitivePaths::default();
        for path in [
            "manifest.json",
            "src/auth.ts",
            "background/auth-helper.js",
            "./shared/api-key.js",
            "/config/secrets/prod.json",
            "app/.env.local",
            "deploy\\k8s\\db-secrets.yaml",
            "infra/terraform/main.tf",
        ] {
            assert!(paths.is_sensitive(path), "{path} should be sensitive");
        }
    }

    #[test]
    fn test_ordinary_paths() {
        let paths = SensitivePaths::default();
        for path in ["src/app.ts", "src/author.ts", "content/view.js", "docs/manifest.json.md"] {
            assert!(!paths.is_sensitive(path), "{path} should not be sensitive");
        }
    }

    #[test]
    fn test_extra_patterns() {
        let paths = SensitivePaths::new(&["^billing/".to_string()]).unwrap();
        assert!(paths.is_sensitive("billing/invoice.ts"));
        assert!(SensitivePaths::new(&["(".to_string()]).is_err());
    }
}
