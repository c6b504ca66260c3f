use super::types::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Breaker counts by health class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

impl ServiceHealth {
    fn count(&mut self, state: CircuitState) {
        self.total += 1;
        match state {
            CircuitState::Closed => self.healthy += 1,
            CircuitState::HalfOpen => self.degraded += 1,
            CircuitState::Open => self.unhealthy += 1,
        }
    }
}

/// Aggregate health of every registered breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub services: BTreeMap<String, ServiceHealth>,
    /// Keys of breakers that are not closed
    pub alerts: Vec<String>,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// One breaker as seen by the health pass
#[derive(Debug, Clone)]
pub struct BreakerHealth {
    pub key: String,
    pub service: String,
    pub state: CircuitState,
}

impl HealthSummary {
    /// Classify every breaker in a single pass
    pub fn compute(breakers: impl IntoIterator<Item = BreakerHealth>) -> Self {
        let mut overall = ServiceHealth::default();
        let mut services: BTreeMap<String, ServiceHealth> = BTreeMap::new();
        let mut alerts = Vec::new();

        for breaker in breakers {
            overall.count(breaker.state);
            services
                .entry(breaker.service)
                .or_default()
                .count(breaker.state);
            if breaker.state != CircuitState::Closed {
                alerts.push(breaker.key);
            }
        }
        alerts.sort();

        let recommendations = recommendations(&overall, &services);

        Self {
            total: overall.total,
            healthy: overall.healthy,
            degraded: overall.degraded,
            unhealthy: overall.unhealthy,
            services,
            alerts,
            recommendations,
            generated_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.unhealthy == 0 && self.degraded == 0
    }
}

fn recommendations(
    overall: &ServiceHealth,
    services: &BTreeMap<String, ServiceHealth>,
) -> Vec<String> {
    let mut out = Vec::new();

    if overall.unhealthy > 0 {
        out.push(format!("{} circuit breakers are open", overall.unhealthy));
    }
    if overall.degraded > 0 {
        out.push(format!(
            "{} circuit breakers are half-open and probing recovery",
            overall.degraded
        ));
    }
    for (service, health) in services {
        if health.unhealthy > health.healthy {
            out.push(format!(
                "Service '{}' has more open than closed circuit breakers",
                service
            ));
        }
    }
    if overall.unhealthy * 2 > overall.total {
        out.push(
            "More than half of all circuit breakers are open; check for a shared dependency outage"
                .to_string(),
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(key: &str, state: CircuitState) -> BreakerHealth {
        let service = key.split(':').next().unwrap_or_default().to_string();
        BreakerHealth {
            key: key.to_string(),
            service,
            state,
        }
    }

    #[test]
    fn test_empty_registry_is_healthy() {
        let summary = HealthSummary::compute(Vec::new());
        assert_eq!(summary.total, 0);
        assert!(summary.is_healthy());
        assert!(summary.recommendations.is_empty());
    }

    #[test]
    fn test_counts_sum_to_total() {
        let summary = HealthSummary::compute(vec![
            b("db:query", CircuitState::Open),
            b("db:insert", CircuitState::Closed),
            b("llm:chat", CircuitState::HalfOpen),
            b("cache:get", CircuitState::Closed),
        ]);

        assert_eq!(summary.total, 4);
        assert_eq!(summary.healthy, 2);
        assert_eq!(summary.degraded, 1);
        assert_eq!(summary.unhealthy, 1);
        assert_eq!(
            summary.healthy + summary.degraded + summary.unhealthy,
            summary.total
        );
        assert_eq!(summary.alerts, vec!["db:query", "llm:chat"]);
        assert_eq!(summary.services["db"].total, 2);
        assert_eq!(summary.services["db"].unhealthy, 1);
        assert!(!summary.is_healthy());
    }

    #[test]
    fn test_recommendations() {
        let summary = HealthSummary::compute(vec![
            b("db:query", CircuitState::Open),
            b("db:insert", CircuitState::Open),
            b("db:delete", CircuitState::Closed),
            b("llm:chat", CircuitState::HalfOpen),
        ]);

        assert!(summary
            .recommendations
            .contains(&"2 circuit breakers are open".to_string()));
        assert!(summary
            .recommendations
            .contains(&"1 circuit breakers are half-open and probing recovery".to_string()));
        assert!(summary
            .recommendations
            .contains(&"Service 'db' has more open than closed circuit breakers".to_string()));
        // 2 open of 4 is not more than half
        assert!(!summary
            .recommendations
            .iter()
            .any(|r| r.starts_with("More than half")));
    }

    #[test]
    fn test_majority_open_recommendation() {
        let summary = HealthSummary::compute(vec![
            b("a:x", CircuitState::Open),
            b("b:x", CircuitState::Open),
            b("c:x", CircuitState::Closed),
        ]);
        assert!(summary
            .recommendations
            .iter()
            .any(|r| r.starts_with("More than half")));
    }
}
