//! Concurrent dependency health checks behind `GET /api/health`

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Always true: the gateway produced this report
    pub gateway: bool,
    pub dependencies: BTreeMap<String, bool>,
    pub checked_at: String,
}

impl HealthReport {
    pub fn from_results(dependencies: BTreeMap<String, bool>) -> Self {
        let status = if dependencies.values().all(|up| *up) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        Self {
            status,
            gateway: true,
            dependencies,
            checked_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub struct HealthAggregator {
    client: reqwest::Client,
    /// (dependency name, health URL)
    targets: Vec<(String, String)>,
    timeout: Duration,
}

impl HealthAggregator {
    pub fn new(client: reqwest::Client, targets: Vec<(String, String)>, timeout: Duration) -> Self {
        Self {
            client,
            targets,
            timeout,
        }
    }

    /// Check every dependency at once. Total latency is bounded by one check timeout.
    pub async fn check_all(&self) -> HealthReport {
        let checks = self.targets.iter().map(|(name, url)| async move {
            let up = self.check_endpoint(name, url).await;
            (name.clone(), up)
        });
        let results: BTreeMap<String, bool> = join_all(checks).await.into_iter().collect();
        HealthReport::from_results(results)
    }

    /// Up iff a 2xx arrives within the timeout and the body does not report `unhealthy`
    pub async fn check_endpoint(&self, name: &str, url: &str) -> bool {
        match time::timeout(self.timeout, self.check_single(url)).await {
            Ok(Ok(healthy)) => {
                if healthy {
                    debug!(dependency = name, "Dependency is healthy");
                } else {
                    warn!(dependency = name, "Dependency health check failed");
                }
                healthy
            }
            Ok(Err(e)) => {
                warn!(dependency = name, error = %e, "Dependency health check error");
                false
            }
            Err(_) => {
                warn!(dependency = name, timeout_ms = self.timeout.as_millis() as u64, "Dependency health check timeout");
                false
            }
        }
    }

    async fn check_single(&self, url: &str) -> Result<bool, reqwest::Error> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body = response.bytes().await?;
        Ok(Self::body_reports_healthy(&body))
    }

    fn body_reports_healthy(body: &[u8]) -> bool {
        match serde_json::from_slice::<Value>(body) {
            Ok(json) => json
                .get("status")
                .and_then(Value::as_str)
                .map(|s| !s.eq_ignore_ascii_case("unhealthy"))
                .unwrap_or(true),
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn dependency(response: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(response)
            .mount(&server)
            .await;
        server
    }

    fn target(name: &str, server: &MockServer) -> (String, String) {
        (name.to_string(), format!("{}/health", server.uri()))
    }

    #[test]
    fn test_report_status() {
        let all_up = BTreeMap::from([("a".to_string(), true), ("b".to_string(), true)]);
        assert_eq!(HealthReport::from_results(all_up).status, HealthStatus::Healthy);

        let one_down = BTreeMap::from([("a".to_string(), true), ("b".to_string(), false)]);
        let report = HealthReport::from_results(one_down);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.gateway);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["dependencies"]["b"], false);
    }

    #[test]
    fn test_body_reports_healthy() {
        assert!(HealthAggregator::body_reports_healthy(br#"{"status":"healthy"}"#));
        assert!(HealthAggregator::body_reports_healthy(b"OK"));
        assert!(HealthAggregator::body_reports_healthy(b""));
        assert!(!HealthAggregator::body_reports_healthy(br#"{"status":"unhealthy"}"#));
    }

    #[tokio::test]
    async fn test_partial_failure_is_degraded_and_concurrent() {
        let auth = dependency(ResponseTemplate::new(200).set_body_json(json!({"status": "healthy"}))).await;
        let ai = dependency(ResponseTemplate::new(200)).await;
        let document = dependency(ResponseTemplate::new(200).set_delay(Duration::from_secs(2))).await;

        let aggregator = HealthAggregator::new(
            reqwest::Client::new(),
            vec![target("auth", &auth), target("ai", &ai), target("document", &document)],
            Duration::from_millis(300),
        );

        let started = Instant::now();
        let report = aggregator.check_all().await;
        let elapsed = started.elapsed();

        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.dependencies.values().filter(|up| !**up).count(), 1);
        assert_eq!(report.dependencies["document"], false);
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_non_success_statuses_are_down() {
        let not_found = dependency(ResponseTemplate::new(404)).await;
        let forbidden = dependency(ResponseTemplate::new(403)).await;
        let unhealthy = dependency(ResponseTemplate::new(200).set_body_json(json!({"status": "unhealthy"}))).await;

        let aggregator = HealthAggregator::new(
            reqwest::Client::new(),
            vec![
                target("a", &not_found),
                target("b", &forbidden),
                target("c", &unhealthy),
            ],
            Duration::from_secs(2),
        );

        let report = aggregator.check_all().await;
        assert!(report.dependencies.values().all(|up| !*up));
    }

    #[tokio::test]
    async fn test_unreachable_dependency_is_down() {
        let aggregator = HealthAggregator::new(
            reqwest::Client::new(),
            vec![("ai".to_string(), "http://127.0.0.1:1/health".to_string())],
            Duration::from_secs(2),
        );
        assert!(!aggregator.check_endpoint("ai", "http://127.0.0.1:1/health").await);
        assert_eq!(aggregator.check_all().await.status, HealthStatus::Degraded);
    }
}
