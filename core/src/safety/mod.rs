//! Pre-execution code screening.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Rule identifier, e.g. `restricted_import`.
    pub rule: String,
    pub message: String,
    /// 1-based line of the offending code, when known.
    #[serde(default)]
    pub line: Option<usize>,
}

impl Violation {
    pub fn new(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub allowed: bool,
    pub violations: Vec<Violation>,
}

impl Validation {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            violations: Vec::new(),
        }
    }

    pub fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            allowed: violations.is_empty(),
            violations,
        }
    }
}

#[async_trait]
pub trait SafetyValidator: Send + Sync {
    fn name(&self) -> &str;
    async fn validate(&self, code: &str, language: &str) -> Validation;
}

/// Validator that accepts everything. Used when screening is disabled.
pub struct AllowAll;

#[async_trait]
impl SafetyValidator for AllowAll {
    fn name(&self) -> &str {
        "allow_all"
    }

    async fn validate(&self, _code: &str, _language: &str) -> Validation {
        Validation::allow()
    }
}
