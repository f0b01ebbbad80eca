//! Pre-execution denial of dangerous command shapes.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::policy::PolicyError;

/// A regular expression plus the reason reported when it matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyPattern {
    pub pattern: String,
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "matches a configured deny pattern".to_string()
}

impl DenyPattern {
    pub fn new(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }
}

const BUILTIN_PATTERNS: &[(&str, &str)] = &[
    (r"\bsudo\b", "privilege escalation (sudo)"),
    (
        r"(?:^|[;&|(]\s*)(?:su|doas)(?:\s|$)",
        "privilege escalation (su/doas)",
    ),
    (
        r"\brm\s+(?:-\S+\s+)*(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)\s+(?:-\S+\s+)*(?:/[^/\s;&|]*|~/?|\$HOME/?)(?:\s|$|[;&|])",
        "recursive delete of a root-level path",
    ),
    (
        r"[\w:]+\s*\(\)\s*\{[^}]*\|\s*[\w:]+\s*&",
        "fork bomb",
    ),
    (
        r"\b(?:curl|wget)\b[^|]*\|\s*(?:sudo\s+)?(?:ba|z|da|k|fi)?sh\b",
        "piping a network download into a shell",
    ),
    (
        r"\b(?:ba|z|da|k)?sh\s+<\(\s*(?:curl|wget)\b",
        "executing a network download in a shell",
    ),
    (
        r"\bchmod\s+(?:-\S+\s+)*(?:0?777|a\+rwx|ugo\+rwx)\b",
        "world-writable permissions (chmod 777)",
    ),
    (r">\s*/dev/sd[a-z]", "writing to a block device"),
    (r"\bdd\s+.*of=/dev/", "dd to a device"),
    (r"\bmkfs(?:\.\w+)?\b", "formatting a filesystem"),
];

/// Compiled denial rules, checked in order; the first match wins.
#[derive(Debug, Clone)]
pub struct DenyList {
    rules: Vec<(Regex, String)>,
}

impl DenyList {
    /// Built-in rules followed by `extra`.
    pub fn new(extra: &[DenyPattern]) -> Result<Self, PolicyError> {
        let builtin = BUILTIN_PATTERNS
            .iter()
            .map(|(pattern, reason)| DenyPattern::new(*pattern, *reason));
        let mut rules = Vec::with_capacity(BUILTIN_PATTERNS.len() + extra.len());
        for entry in builtin.chain(extra.iter().cloned()) {
            let regex = Regex::new(&entry.pattern).map_err(|e| PolicyError::BadPattern {
                pattern: entry.pattern.clone(),
                reason: e.to_string(),
            })?;
            rules.push((regex, entry.reason));
        }
        Ok(Self { rules })
    }

    /// The reason `command` is denied, if any rule matches.
    pub fn check(&self, command: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(command))
            .map(|(_, reason)| reason.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
