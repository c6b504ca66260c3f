//! Pattern-based configuration defaults.
//!
//! A pattern pairs two name predicates (service, operation) with a
//! recommended configuration. Patterns are kept ordered by confidence
//! (descending), then priority (descending), then id, and the first pattern
//! whose predicates both match wins.

use super::types::{CircuitBreakerOverrides, DegradationMode};
use crate::error::{ResilienceError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

/// Predicate over a service or operation name. Comparisons ignore ASCII case.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "match", content = "value", rename_all = "snake_case")]
pub enum NameMatcher {
    #[default]
    Any,
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    AnyOf(Vec<NameMatcher>),
    /// Code-only predicate; not representable in configuration files
    #[serde(skip)]
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl NameMatcher {
    pub fn contains_any(needles: &[&str]) -> Self {
        NameMatcher::AnyOf(
            needles
                .iter()
                .map(|n| NameMatcher::Contains(n.to_string()))
                .collect(),
        )
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        NameMatcher::Predicate(Arc::new(f))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameMatcher::Any => true,
            NameMatcher::Exact(expected) => name.eq_ignore_ascii_case(expected),
            NameMatcher::Prefix(prefix) => name
                .to_ascii_lowercase()
                .starts_with(&prefix.to_ascii_lowercase()),
            NameMatcher::Suffix(suffix) => name
                .to_ascii_lowercase()
                .ends_with(&suffix.to_ascii_lowercase()),
            NameMatcher::Contains(needle) => name
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
            NameMatcher::AnyOf(matchers) => matchers.iter().any(|m| m.matches(name)),
            NameMatcher::Predicate(f) => f(name),
        }
    }
}

impl std::fmt::Debug for NameMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NameMatcher::Any => write!(f, "Any"),
            NameMatcher::Exact(s) => f.debug_tuple("Exact").field(s).finish(),
            NameMatcher::Prefix(s) => f.debug_tuple("Prefix").field(s).finish(),
            NameMatcher::Suffix(s) => f.debug_tuple("Suffix").field(s).finish(),
            NameMatcher::Contains(s) => f.debug_tuple("Contains").field(s).finish(),
            NameMatcher::AnyOf(m) => f.debug_tuple("AnyOf").field(m).finish(),
            NameMatcher::Predicate(_) => write!(f, "Predicate(<fn>)"),
        }
    }
}

/// Named configuration rule matched against `service`/`operation` names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerPattern {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub service: NameMatcher,
    #[serde(default)]
    pub operation: NameMatcher,
    /// Recommended configuration
    #[serde(default)]
    pub config: CircuitBreakerOverrides,
    /// 0.0 - 1.0; higher wins
    pub confidence: f64,
    /// Tie-break between equal confidences; higher wins
    #[serde(default)]
    pub priority: i32,
    /// Tags attached to every breaker this pattern configures
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
}

impl CircuitBreakerPattern {
    pub fn new(
        id: impl Into<String>,
        service: NameMatcher,
        operation: NameMatcher,
        config: CircuitBreakerOverrides,
        confidence: f64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            service,
            operation,
            config,
            confidence,
            priority: 0,
            tags: Vec::new(),
            usage_count: 0,
            success_count: 0,
            failure_count: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn matches(&self, service: &str, operation: &str) -> bool {
        self.service.matches(service) && self.operation.matches(operation)
    }

    /// Share of successful protected calls through breakers this pattern configured
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ResilienceError::Config(
                "Pattern id cannot be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ResilienceError::Config(format!(
                "Pattern '{}' confidence must be within [0, 1], got {}",
                self.id, self.confidence
            )));
        }
        Ok(())
    }
}

fn pattern_order(a: &CircuitBreakerPattern, b: &CircuitBreakerPattern) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.id.cmp(&b.id))
}

/// Ordered pattern list
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<CircuitBreakerPattern>,
}

impl PatternSet {
    /// Build a set; later duplicates of an id replace earlier ones
    pub fn new(patterns: Vec<CircuitBreakerPattern>) -> Self {
        let mut set = Self::default();
        for pattern in patterns {
            set.upsert(pattern);
        }
        set
    }

    pub fn builtin() -> Self {
        Self::new(builtin_patterns())
    }

    /// Insert or replace by id, keeping the list ordered. Returns true on replace.
    pub fn upsert(&mut self, pattern: CircuitBreakerPattern) -> bool {
        let replaced = match self.patterns.iter_mut().find(|p| p.id == pattern.id) {
            Some(existing) => {
                *existing = pattern;
                true
            }
            None => {
                self.patterns.push(pattern);
                false
            }
        };
        self.patterns.sort_by(pattern_order);
        replaced
    }

    pub fn remove(&mut self, id: &str) -> Option<CircuitBreakerPattern> {
        let index = self.patterns.iter().position(|p| p.id == id)?;
        Some(self.patterns.remove(index))
    }

    pub fn find_match(&self, service: &str, operation: &str) -> Option<&CircuitBreakerPattern> {
        self.patterns.iter().find(|p| p.matches(service, operation))
    }

    pub fn get(&self, id: &str) -> Option<&CircuitBreakerPattern> {
        self.patterns.iter().find(|p| p.id == id)
    }

    pub fn record_usage(&mut self, id: &str) {
        if let Some(pattern) = self.patterns.iter_mut().find(|p| p.id == id) {
            pattern.usage_count += 1;
        }
    }

    pub fn record_outcome(&mut self, id: &str, success: bool) {
        if let Some(pattern) = self.patterns.iter_mut().find(|p| p.id == id) {
            if success {
                pattern.success_count += 1;
            } else {
                pattern.failure_count += 1;
            }
        }
    }

    pub fn as_slice(&self) -> &[CircuitBreakerPattern] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Patterns available when configuration supplies none
pub fn builtin_patterns() -> Vec<CircuitBreakerPattern> {
    vec![
        CircuitBreakerPattern::new(
            "llm-api-pattern",
            NameMatcher::contains_any(&["llm", "openai", "anthropic", "gpt"]),
            NameMatcher::Any,
            CircuitBreakerOverrides {
                failure_threshold: Some(3),
                timeout_ms: Some(30_000),
                reset_timeout_ms: Some(60_000),
                degradation_mode: Some(DegradationMode::UseFallback),
                ..Default::default()
            },
            0.9,
        )
        .with_description("Slow, rate-limited model provider APIs")
        .with_tags(&["llm", "external"]),
        CircuitBreakerPattern::new(
            "database-pattern",
            NameMatcher::contains_any(&["db", "database", "postgres", "mysql", "sqlite"]),
            NameMatcher::Any,
            CircuitBreakerOverrides {
                failure_threshold: Some(3),
                timeout_ms: Some(5_000),
                reset_timeout_ms: Some(30_000),
                ..Default::default()
            },
            0.85,
        )
        .with_description("Primary data stores")
        .with_tags(&["database"]),
        CircuitBreakerPattern::new(
            "cache-pattern",
            NameMatcher::contains_any(&["cache", "redis"]),
            NameMatcher::Any,
            CircuitBreakerOverrides {
                failure_threshold: Some(10),
                timeout_ms: Some(1_000),
                reset_timeout_ms: Some(15_000),
                degradation_mode: Some(DegradationMode::UseFallback),
                ..Default::default()
            },
            0.7,
        )
        .with_description("Caches that can be bypassed")
        .with_tags(&["cache"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(id: &str, confidence: f64) -> CircuitBreakerPattern {
        CircuitBreakerPattern::new(
            id,
            NameMatcher::Any,
            NameMatcher::Any,
            CircuitBreakerOverrides::default(),
            confidence,
        )
    }

    #[test]
    fn test_name_matchers() {
        assert!(NameMatcher::Any.matches("anything"));
        assert!(NameMatcher::Exact("Payments".to_string()).matches("payments"));
        assert!(!NameMatcher::Exact("payments".to_string()).matches("payments-v2"));
        assert!(NameMatcher::Prefix("pay".to_string()).matches("payments"));
        assert!(NameMatcher::Suffix("-api".to_string()).matches("billing-API"));
        assert!(NameMatcher::Contains("llm".to_string()).matches("openai-LLM"));
        assert!(NameMatcher::contains_any(&["db", "redis"]).matches("redis-main"));
        assert!(!NameMatcher::contains_any(&["db", "redis"]).matches("search"));
        assert!(NameMatcher::predicate(|n| n.len() == 3).matches("abc"));
    }

    #[test]
    fn test_upsert_keeps_descending_confidence() {
        let mut set = PatternSet::default();
        set.upsert(pattern("low", 0.2));
        set.upsert(pattern("high", 0.9));
        set.upsert(pattern("mid", 0.5));

        let ids: Vec<&str> = set.as_slice().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_upsert_replaces_duplicate_id() {
        let mut set = PatternSet::default();
        assert!(!set.upsert(pattern("p", 0.2)));
        set.upsert(pattern("q", 0.5));
        assert!(set.upsert(pattern("p", 0.8)));

        assert_eq!(set.len(), 2);
        assert_eq!(set.as_slice()[0].id, "p");
        assert_eq!(set.get("p").unwrap().confidence, 0.8);
    }

    #[test]
    fn test_priority_breaks_confidence_ties() {
        let mut set = PatternSet::default();
        set.upsert(pattern("a", 0.5));
        set.upsert(pattern("b", 0.5).with_priority(10));

        assert_eq!(set.find_match("svc", "op").unwrap().id, "b");
    }

    #[test]
    fn test_first_match_requires_both_predicates() {
        let mut set = PatternSet::default();
        set.upsert(CircuitBreakerPattern::new(
            "writes",
            NameMatcher::Any,
            NameMatcher::Prefix("write".to_string()),
            CircuitBreakerOverrides::default(),
            0.9,
        ));
        set.upsert(CircuitBreakerPattern::new(
            "db",
            NameMatcher::Exact("db".to_string()),
            NameMatcher::Any,
            CircuitBreakerOverrides::default(),
            0.5,
        ));

        assert_eq!(set.find_match("db", "write_row").unwrap().id, "writes");
        assert_eq!(set.find_match("db", "read_row").unwrap().id, "db");
        assert!(set.find_match("search", "read_row").is_none());
    }

    #[test]
    fn test_builtin_patterns() {
        let set = PatternSet::builtin();
        assert_eq!(set.as_slice()[0].id, "llm-api-pattern");

        let llm = set.find_match("openai-llm", "chat").unwrap();
        assert_eq!(llm.config.failure_threshold, Some(3));
        assert_eq!(llm.config.timeout_ms, Some(30_000));

        assert_eq!(set.find_match("postgres", "query").unwrap().id, "database-pattern");
        assert!(set.find_match("search", "query").is_none());
    }

    #[test]
    fn test_usage_and_success_rate() {
        let mut set = PatternSet::new(vec![pattern("p", 0.5)]);
        assert_eq!(set.get("p").unwrap().success_rate(), 1.0);

        set.record_usage("p");
        set.record_outcome("p", true);
        set.record_outcome("p", true);
        set.record_outcome("p", false);
        set.record_outcome("missing", true);

        let p = set.get("p").unwrap();
        assert_eq!(p.usage_count, 1);
        assert_eq!(p.success_count, 2);
        assert!((p.success_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pattern_from_yaml() {
        let yaml = r#"
id: search-pattern
name: Search backends
service:
  match: any_of
  value:
    - match: contains
      value: search
    - match: prefix
      value: es-
operation:
  match: any
config:
  failure_threshold: 4
confidence: 0.6
"#;
        let pattern: CircuitBreakerPattern = serde_yaml::from_str(yaml).unwrap();
        assert!(pattern.matches("es-cluster", "query"));
        assert!(pattern.matches("product-search", "query"));
        assert_eq!(pattern.config.failure_threshold, Some(4));
        assert!(pattern.validate().is_ok());
    }

    #[test]
    fn test_validate_confidence_range() {
        assert!(pattern("p", 1.2).validate().is_err());
        assert!(pattern("", 0.5).validate().is_err());
    }
}
