use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A secret a backend provider must sync before builds or dev runs.
/// Values are never stored here; they are resolved from the process
/// environment at sync time and travel to the provider CLI over stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    /// Secret class understood by the provider CLI (e.g. "production").
    #[serde(rename = "type")]
    pub kind: String,
    /// Environment variable name holding the value.
    pub name: String,
}

impl SecretSpec {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Names of environment variables whose values must never reach logs,
/// error messages, or rendered artifacts.
#[derive(Debug, Clone, Default)]
pub struct SecretNames {
    names: BTreeSet<String>,
}

impl SecretNames {
    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a SecretSpec>) -> Self {
        Self {
            names: specs.into_iter().map(|s| s.name.clone()).collect(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Display-safe rendering of an environment pair. Secret values are
    /// replaced with a length marker so operators can still spot empty
    /// values in the output.
    pub fn display_pair(&self, key: &str, value: &str) -> String {
        if self.contains(key) {
            format!("{key}=<redacted {} bytes>", value.len())
        } else {
            format!("{key}={value}")
        }
    }

    /// Scrub any known secret value out of free-form text (stderr from a
    /// child process, provider error detail) before it is logged.
    pub fn scrub(&self, text: &str, env: &[(String, String)]) -> String {
        let mut scrubbed = text.to_string();
        for (key, value) in env {
            if !value.is_empty() && self.contains(key) {
                scrubbed = scrubbed.replace(value.as_str(), "<redacted>");
            }
        }
        scrubbed
    }
}
