use crate::circuit_breaker::CircuitState;
use crate::error::{ResilienceError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Error severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
    Fatal,
}

impl ErrorSeverity {
    /// Severities that force the breaker open immediately
    pub fn forces_open(&self) -> bool {
        matches!(self, ErrorSeverity::Critical | ErrorSeverity::Fatal)
    }
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimit,
    Authentication,
    Validation,
    Resource,
    CircuitOpen,
    Internal,
    Unknown,
}

/// The failing error as seen by the classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Text the classification rules are matched against
    fn haystack(&self) -> String {
        format!("{}: {}", self.error_type, self.message)
    }
}

/// Where the failure happened
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub service: String,
    pub operation: String,
    pub key: String,
    pub state: CircuitState,
    pub usage_count: u64,
    pub timestamp: DateTime<Utc>,
}

/// Classifier verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub retryable: bool,
    /// Name of the rule that matched, if any
    pub rule: Option<String>,
}

impl ErrorClassification {
    fn unmatched() -> Self {
        Self {
            severity: ErrorSeverity::Medium,
            category: ErrorCategory::Unknown,
            retryable: true,
            rule: None,
        }
    }
}

/// Classifies errors raised by protected calls
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &ErrorInfo, context: &ErrorContext) -> ErrorClassification;
}

/// Declarative classification rule as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierRuleConfig {
    pub name: String,
    /// Regular expression matched against `"{type}: {message}"`
    pub pattern: String,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    #[serde(default)]
    pub retryable: bool,
}

/// Compiled classification rule
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    name: String,
    pattern: Regex,
    severity: ErrorSeverity,
    category: ErrorCategory,
    retryable: bool,
}

impl ClassificationRule {
    pub fn compile(config: &ClassifierRuleConfig) -> Result<Self> {
        let pattern = Regex::new(&config.pattern).map_err(|e| {
            ResilienceError::Config(format!(
                "Invalid classifier rule '{}' pattern '{}': {}",
                config.name, config.pattern, e
            ))
        })?;

        Ok(Self {
            name: config.name.clone(),
            pattern,
            severity: config.severity,
            category: config.category,
            retryable: config.retryable,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn rule(
    name: &str,
    pattern: &str,
    severity: ErrorSeverity,
    category: ErrorCategory,
    retryable: bool,
) -> ClassifierRuleConfig {
    ClassifierRuleConfig {
        name: name.to_string(),
        pattern: pattern.to_string(),
        severity,
        category,
        retryable,
    }
}

/// Built-in rules, most severe first
pub fn builtin_rules() -> Vec<ClassifierRuleConfig> {
    use ErrorCategory::*;
    use ErrorSeverity::*;

    vec![
        rule("fatal", r"(?i)\bfatal\b|\bpanic|corrupt", Fatal, Internal, false),
        rule(
            "resource-exhausted",
            r"(?i)out of memory|disk full|no space left|too many open files|resource exhausted",
            Critical,
            Resource,
            false,
        ),
        rule(
            "circuit-open",
            r"(?i)\bcircuit ?open\b|circuit breaker \S+ rejected",
            Low,
            CircuitOpen,
            true,
        ),
        rule(
            "timeout",
            r"(?i)timed? ?out|deadline exceeded",
            Medium,
            Timeout,
            true,
        ),
        rule(
            "rate-limit",
            r"(?i)rate.?limit|too many requests|\b429\b",
            Medium,
            RateLimit,
            true,
        ),
        rule(
            "network",
            r"(?i)connection (refused|reset|closed|aborted)|broken pipe|network unreachable|dns",
            High,
            Network,
            true,
        ),
        rule(
            "authentication",
            r"(?i)unauthori[sz]ed|forbidden|\b40[13]\b|invalid (api )?key",
            High,
            Authentication,
            false,
        ),
        rule(
            "validation",
            r"(?i)invalid (argument|input|request)|validation|bad request|\b400\b",
            Low,
            Validation,
            false,
        ),
    ]
}

/// First-match-wins regex classifier
#[derive(Debug, Clone)]
pub struct RuleBasedClassifier {
    rules: Vec<ClassificationRule>,
}

impl RuleBasedClassifier {
    /// Build a classifier with `extra` rules evaluated before the built-in ones
    pub fn new(extra: &[ClassifierRuleConfig]) -> Result<Self> {
        let rules = extra
            .iter()
            .chain(builtin_rules().iter())
            .map(ClassificationRule::compile)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }
}

impl Default for RuleBasedClassifier {
    fn default() -> Self {
        let rules = builtin_rules()
            .iter()
            .filter_map(|config| match ClassificationRule::compile(config) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!(rule = %config.name, error = %e, "Skipping built-in classifier rule");
                    None
                }
            })
            .collect();

        Self { rules }
    }
}

impl ErrorClassifier for RuleBasedClassifier {
    fn classify(&self, error: &ErrorInfo, context: &ErrorContext) -> ErrorClassification {
        let haystack = error.haystack();

        let classification = self
            .rules
            .iter()
            .find(|rule| rule.pattern.is_match(&haystack))
            .map(|rule| ErrorClassification {
                severity: rule.severity,
                category: rule.category,
                retryable: rule.retryable,
                rule: Some(rule.name.clone()),
            })
            .unwrap_or_else(ErrorClassification::unmatched);

        debug!(
            key = %context.key,
            severity = %classification.severity,
            category = ?classification.category,
            rule = ?classification.rule,
            "Classified error"
        );

        classification
    }
}
