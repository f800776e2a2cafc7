//! API request and response models

use chrono::{DateTime, Duration, Utc};
use ct_core::model::{
    IntegrationConfig, RepositoryRef, StepKind, StepStatus, TargetScope, ValidationKind,
    ValidationRequest, Workflow, WorkflowStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Rough per-step execution estimate surfaced to pollers.
const STEP_ESTIMATE_SECS: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct RepositoryBody {
    pub url: String,
    pub auth_token: Option<String>,
    pub commit_id: Option<String>,
}

impl From<RepositoryBody> for RepositoryRef {
    fn from(body: RepositoryBody) -> Self {
        RepositoryRef {
            url: body.url,
            auth_token: body.auth_token,
            commit_id: body.commit_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IntegrationConfigBody {
    pub endpoint: String,
    pub auth_token: Option<String>,
    pub check_query: String,
    pub success_criteria: Option<String>,
}

impl From<IntegrationConfigBody> for IntegrationConfig {
    fn from(body: IntegrationConfigBody) -> Self {
        IntegrationConfig {
            endpoint: body.endpoint,
            auth_token: body.auth_token,
            check_query: body.check_query,
            success_criteria: body.success_criteria,
        }
    }
}

fn default_kind() -> ValidationKind {
    ValidationKind::AiAssisted
}

#[derive(Debug, Deserialize)]
pub struct ItemValidationBody {
    pub checklist_item_id: String,
    #[serde(default = "default_kind")]
    pub validation_type: ValidationKind,
    pub evidence_context: Option<String>,
    #[serde(default)]
    pub code_snippets: Vec<String>,
    pub requirement_text: Option<String>,
    pub repository: Option<RepositoryBody>,
}

impl ItemValidationBody {
    pub fn into_request(self) -> ValidationRequest {
        let mut item_requirements = HashMap::new();
        if let Some(text) = self.requirement_text {
            item_requirements.insert(self.checklist_item_id.clone(), text);
        }
        ValidationRequest {
            id: Uuid::new_v4(),
            scope: TargetScope::Item {
                checklist_item_id: self.checklist_item_id,
            },
            kind: self.validation_type,
            evidence_context: self.evidence_context,
            code_snippets: self.code_snippets,
            repository: self.repository.map(Into::into),
            item_requirements,
            focus_areas: Vec::new(),
            integrations: Vec::new(),
            integration_configs: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchValidationBody {
    pub checklist_item_ids: Vec<String>,
    #[serde(default = "default_kind")]
    pub validation_type: ValidationKind,
    pub evidence_context: Option<String>,
    #[serde(default)]
    pub code_snippets: Vec<String>,
    /// Requirement text keyed by checklist item id.
    #[serde(default)]
    pub item_requirements: HashMap<String, String>,
    pub repository: Option<RepositoryBody>,
}

impl BatchValidationBody {
    pub fn into_request(self) -> ValidationRequest {
        ValidationRequest {
            id: Uuid::new_v4(),
            scope: TargetScope::Batch {
                checklist_item_ids: self.checklist_item_ids,
            },
            kind: self.validation_type,
            evidence_context: self.evidence_context,
            code_snippets: self.code_snippets,
            repository: self.repository.map(Into::into),
            item_requirements: self.item_requirements,
            focus_areas: Vec::new(),
            integrations: Vec::new(),
            integration_configs: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ApplicationValidationBody {
    #[serde(default)]
    pub focus_areas: Vec<String>,
    /// Checklist items to maintain per-item results for.
    #[serde(default)]
    pub checklist_item_ids: Vec<String>,
    #[serde(default)]
    pub integrations: Vec<String>,
    #[serde(default)]
    pub integration_configs: HashMap<String, IntegrationConfigBody>,
    #[serde(default = "default_kind")]
    pub validation_type: ValidationKind,
    pub evidence_context: Option<String>,
    pub repository: Option<RepositoryBody>,
}

impl ApplicationValidationBody {
    pub fn into_request(self, application_id: String) -> ValidationRequest {
        ValidationRequest {
            id: Uuid::new_v4(),
            scope: TargetScope::Application {
                application_id,
                checklist_item_ids: self.checklist_item_ids,
            },
            kind: self.validation_type,
            evidence_context: self.evidence_context,
            code_snippets: Vec::new(),
            repository: self.repository.map(Into::into),
            item_requirements: HashMap::new(),
            focus_areas: self.focus_areas,
            integrations: self.integrations,
            integration_configs: self
                .integration_configs
                .into_iter()
                .map(|(id, config)| (id, config.into()))
                .collect(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Serialize)]
pub struct SubmitItemResponse {
    pub validation_id: Uuid,
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub estimated_completion_time: DateTime<Utc>,
    pub message: String,
}

#[derive(Serialize)]
pub struct SubmitBatchResponse {
    pub validation_ids: Vec<Uuid>,
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub estimated_completion_time: DateTime<Utc>,
    pub message: String,
}

#[derive(Serialize)]
pub struct SubmitApplicationResponse {
    /// For application-wide validation the workflow id doubles as the
    /// validation id pollers use.
    pub validation_id: Uuid,
    pub status: WorkflowStatus,
    pub estimated_completion_time: DateTime<Utc>,
    pub message: String,
}

#[derive(Serialize)]
pub struct StepResponse {
    pub id: Uuid,
    pub label: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub integration_source: Option<String>,
    pub compliant: Option<bool>,
}

#[derive(Serialize)]
pub struct WorkflowResponse {
    pub id: Uuid,
    pub application_id: Option<String>,
    pub status: WorkflowStatus,
    pub overall_compliance: Option<bool>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Present while the workflow is still live.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion_time: Option<DateTime<Utc>>,
    pub steps: Vec<StepResponse>,
}

impl From<Workflow> for WorkflowResponse {
    fn from(workflow: Workflow) -> Self {
        let live_steps = workflow
            .steps
            .iter()
            .filter(|s| !s.status.is_terminal())
            .count();
        let estimated_completion_time = if workflow.status.is_terminal() {
            None
        } else {
            Some(estimate_completion(workflow.created_at, live_steps))
        };
        WorkflowResponse {
            id: workflow.id,
            application_id: workflow.application_id,
            status: workflow.status,
            overall_compliance: workflow.overall_compliance,
            summary: workflow.summary,
            created_at: workflow.created_at,
            completed_at: workflow.completed_at,
            estimated_completion_time,
            steps: workflow
                .steps
                .into_iter()
                .map(|step| StepResponse {
                    id: step.id,
                    label: step.kind.label(),
                    kind: step.kind,
                    status: step.status,
                    started_at: step.started_at,
                    completed_at: step.completed_at,
                    result_summary: step.result_summary,
                    error_message: step.error_message,
                    integration_source: step.integration_source,
                    compliant: step.compliant,
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
pub struct ItemResultsResponse {
    pub checklist_item_id: String,
    pub latest: Option<ct_core::model::ValidationResult>,
    pub history: Vec<ct_core::model::ValidationResult>,
}

/// Steps run concurrently, so the estimate is a flat per-step allowance from
/// the submission time rather than a sum. A live workflow polled after the
/// allowance has elapsed keeps a forward-looking estimate instead of one in
/// the past.
pub fn estimate_completion(from: DateTime<Utc>, live_steps: usize) -> DateTime<Utc> {
    let target = from + Duration::seconds(STEP_ESTIMATE_SECS * live_steps.max(1) as i64);
    target.max(Utc::now() + Duration::seconds(STEP_ESTIMATE_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_body_carries_requirement_into_the_request() {
        let body = ItemValidationBody {
            checklist_item_id: "item-7".to_string(),
            validation_type: default_kind(),
            evidence_context: Some("retry wrapper around outbound calls".to_string()),
            code_snippets: vec!["fn retry() {}".to_string()],
            requirement_text: Some("outbound calls must retry".to_string()),
            repository: None,
        };
        let request = body.into_request();
        assert!(matches!(
            &request.scope,
            TargetScope::Item { checklist_item_id } if checklist_item_id == "item-7"
        ));
        assert_eq!(
            request.item_requirements.get("item-7").map(String::as_str),
            Some("outbound calls must retry")
        );
        assert_eq!(request.kind, ValidationKind::AiAssisted);
    }

    #[test]
    fn terminal_workflows_carry_no_estimate() {
        let request = ItemValidationBody {
            checklist_item_id: "item-1".to_string(),
            validation_type: default_kind(),
            evidence_context: None,
            code_snippets: Vec::new(),
            requirement_text: None,
            repository: None,
        }
        .into_request();
        let workflow_id = Uuid::new_v4();
        let steps = vec![ct_core::model::Step::queued(
            workflow_id,
            StepKind::ItemCheck {
                checklist_item_id: "item-1".to_string(),
            },
        )];
        let mut workflow = Workflow::new(workflow_id, &request, steps);

        let live: WorkflowResponse = workflow.clone().into();
        assert!(live.estimated_completion_time.is_some());

        workflow.status = WorkflowStatus::Completed;
        let done: WorkflowResponse = workflow.into();
        assert!(done.estimated_completion_time.is_none());
    }

    #[test]
    fn estimate_stays_ahead_of_the_clock() {
        // Fresh submission: the full per-step allowance from the start time.
        let now = Utc::now();
        let fresh = estimate_completion(now, 2);
        assert!(fresh >= now + Duration::seconds(2 * STEP_ESTIMATE_SECS));

        // A workflow still live past its allowance keeps a future estimate.
        let stale = estimate_completion(now - Duration::hours(1), 2);
        assert!(stale > Utc::now());
    }
}
