//! External integration checks
//!
//! Runs a configured check against an external system (CI, code quality,
//! monitoring) and reduces the reply to pass/fail/error. When the
//! integration config carries success criteria, the reply body is matched
//! against it; otherwise a `status` field in the JSON reply decides.

use async_trait::async_trait;
use ct_core::capabilities::{
    CheckOutcome, CheckStatus, IntegrationCheck, IntegrationClient, IntegrationError,
};
use serde_json::Value;

/// Configuration for the integration client
#[derive(Debug, Clone)]
pub struct IntegrationClientConfig {
    /// User agent string
    pub user_agent: String,

    /// Request timeout (seconds)
    pub timeout_secs: u64,
}

impl Default for IntegrationClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "ComplianceTracker/1.0".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Integration client speaking plain HTTP to each configured endpoint.
pub struct HttpIntegrationClient {
    config: IntegrationClientConfig,
    client: reqwest::Client,
}

impl HttpIntegrationClient {
    pub fn new(config: IntegrationClientConfig) -> Result<Self, IntegrationError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IntegrationError::Transport(e.to_string()))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl IntegrationClient for HttpIntegrationClient {
    async fn run(&self, check: &IntegrationCheck) -> Result<CheckOutcome, IntegrationError> {
        let config = &check.config;
        let mut request = self
            .client
            .get(&config.endpoint)
            .query(&[("q", config.check_query.as_str())]);
        if let Some(token) = &config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                IntegrationError::Timeout(self.config.timeout_secs)
            } else {
                IntegrationError::Transport(format!("{}: {e}", check.integration_id))
            }
        })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(IntegrationError::AuthFailed(check.integration_id.clone()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| IntegrationError::Transport(format!("{}: {e}", check.integration_id)))?;

        tracing::debug!(
            "Integration {} replied HTTP {} ({} bytes)",
            check.integration_id,
            status,
            body.len()
        );
        Ok(evaluate_reply(
            &check.integration_id,
            status.is_success(),
            &body,
            check.config.success_criteria.as_deref(),
        ))
    }
}

/// Reduce an integration reply to a check outcome.
///
/// Success criteria, when configured, take precedence: the check passes iff
/// the body contains the criteria string. Without criteria, a JSON `status`
/// field of `success`/`passed`/`ok` passes and `failure`/`failed` fails;
/// anything else is an error the caller treats as a failed step.
fn evaluate_reply(
    integration_id: &str,
    http_ok: bool,
    body: &str,
    success_criteria: Option<&str>,
) -> CheckOutcome {
    let detail: Value = serde_json::from_str(body).unwrap_or(Value::Null);

    if !http_ok {
        return CheckOutcome {
            status: CheckStatus::Error,
            message: format!("{integration_id} returned a non-success HTTP status"),
            detail,
        };
    }

    if let Some(criteria) = success_criteria {
        let passed = body.contains(criteria);
        return CheckOutcome {
            status: if passed {
                CheckStatus::Success
            } else {
                CheckStatus::Failure
            },
            message: if passed {
                format!("{integration_id} reply matched success criteria")
            } else {
                format!("{integration_id} reply did not match success criteria")
            },
            detail,
        };
    }

    let reported = detail
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase);
    match reported.as_deref() {
        Some("success") | Some("passed") | Some("ok") => CheckOutcome {
            status: CheckStatus::Success,
            message: format!("{integration_id} reported success"),
            detail,
        },
        Some("failure") | Some("failed") => CheckOutcome {
            status: CheckStatus::Failure,
            message: format!("{integration_id} reported failure"),
            detail,
        },
        Some(other) => CheckOutcome {
            status: CheckStatus::Error,
            message: format!("{integration_id} reported unrecognized status {other:?}"),
            detail,
        },
        None => CheckOutcome {
            status: CheckStatus::Error,
            message: format!("{integration_id} reply carried no status field"),
            detail,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_criteria_wins_over_status_field() {
        let body = r#"{"status": "failed", "quality_gate": "PASSED"}"#;
        let outcome = evaluate_reply("sonarqube", true, body, Some("\"quality_gate\": \"PASSED\""));
        assert_eq!(outcome.status, CheckStatus::Success);

        let outcome = evaluate_reply("sonarqube", true, body, Some("\"quality_gate\": \"OK\""));
        assert_eq!(outcome.status, CheckStatus::Failure);
    }

    #[test]
    fn status_field_drives_the_outcome_without_criteria() {
        let passed = evaluate_reply("jenkins", true, r#"{"status": "SUCCESS"}"#, None);
        assert_eq!(passed.status, CheckStatus::Success);

        let failed = evaluate_reply("jenkins", true, r#"{"status": "failure"}"#, None);
        assert_eq!(failed.status, CheckStatus::Failure);

        let odd = evaluate_reply("jenkins", true, r#"{"status": "building"}"#, None);
        assert_eq!(odd.status, CheckStatus::Error);
    }

    #[test]
    fn unparseable_or_statusless_replies_are_errors() {
        let outcome = evaluate_reply("grafana", true, "<html>dashboard</html>", None);
        assert_eq!(outcome.status, CheckStatus::Error);
        assert_eq!(outcome.detail, Value::Null);

        let outcome = evaluate_reply("grafana", false, r#"{"status": "success"}"#, None);
        assert_eq!(outcome.status, CheckStatus::Error);
    }
}
