//! Domain model for validation workflows
//!
//! A `ValidationRequest` describes what the user asked to validate. The
//! orchestrator turns it into a `Workflow` owning an ordered list of `Step`s,
//! and maintains one `ValidationResult` (owning `Finding`s) per checklist
//! item in scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Workflow lifecycle. Transitions are forward-only:
/// pending -> in_progress -> (completed | failed), with pending -> failed
/// reachable through cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(WorkflowStatus::Pending),
            "in_progress" => Some(WorkflowStatus::InProgress),
            "completed" => Some(WorkflowStatus::Completed),
            "failed" => Some(WorkflowStatus::Failed),
            _ => None,
        }
    }

    /// Whether `next` is a legal forward move from `self`.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        matches!(
            (self, next),
            (WorkflowStatus::Pending, WorkflowStatus::InProgress)
                | (WorkflowStatus::Pending, WorkflowStatus::Failed)
                | (WorkflowStatus::InProgress, WorkflowStatus::Completed)
                | (WorkflowStatus::InProgress, WorkflowStatus::Failed)
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step lifecycle. `skipped` marks a step whose precondition was unmet; it
/// is terminal and never blocks the workflow from finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Queued => "queued",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(StepStatus::Queued),
            "running" => Some(StepStatus::Running),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            "skipped" => Some(StepStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    Manual,
    Automated,
    AiAssisted,
}

impl ValidationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationKind::Manual => "manual",
            ValidationKind::Automated => "automated",
            ValidationKind::AiAssisted => "ai_assisted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(ValidationKind::Manual),
            "automated" => Some(ValidationKind::Automated),
            "ai_assisted" => Some(ValidationKind::AiAssisted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    User,
    ExternalSystem,
    Ai,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::User => "user",
            SourceKind::ExternalSystem => "external_system",
            SourceKind::Ai => "ai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(SourceKind::User),
            "external_system" => Some(SourceKind::ExternalSystem),
            "ai" => Some(SourceKind::Ai),
            _ => None,
        }
    }
}

/// Severity levels for findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a validation request targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum TargetScope {
    Item {
        checklist_item_id: String,
    },
    Batch {
        checklist_item_ids: Vec<String>,
    },
    Application {
        application_id: String,
        /// Checklist items to maintain per-item results for. The checklist
        /// store itself is an external collaborator, so only ids named here
        /// get result records.
        #[serde(default)]
        checklist_item_ids: Vec<String>,
    },
}

impl TargetScope {
    pub fn checklist_item_ids(&self) -> &[String] {
        match self {
            TargetScope::Item { checklist_item_id } => std::slice::from_ref(checklist_item_id),
            TargetScope::Batch { checklist_item_ids } => checklist_item_ids,
            TargetScope::Application {
                checklist_item_ids, ..
            } => checklist_item_ids,
        }
    }

    pub fn application_id(&self) -> Option<&str> {
        match self {
            TargetScope::Application { application_id, .. } => Some(application_id),
            _ => None,
        }
    }

    /// A scope with nothing to validate is rejected at submission.
    pub fn is_empty(&self) -> bool {
        match self {
            TargetScope::Item { checklist_item_id } => checklist_item_id.is_empty(),
            TargetScope::Batch { checklist_item_ids } => checklist_item_ids.is_empty(),
            TargetScope::Application { application_id, .. } => application_id.is_empty(),
        }
    }
}

/// Reference to the repository evidence is fetched from. The auth token is
/// request-scoped; it travels with the reference instead of living in
/// process-wide state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
}

impl RepositoryRef {
    /// Browsable URL pointing at the exact revision that was analyzed.
    pub fn evidence_url(&self) -> String {
        match &self.commit_id {
            Some(commit) => format!("{}/tree/{}", self.url.trim_end_matches('/'), commit),
            None => self.url.clone(),
        }
    }
}

/// Configuration for one external integration check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub check_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<String>,
}

/// One user-initiated ask to validate a checklist item, a batch of items, or
/// an entire application. Immutable once created; re-validation is a new
/// request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub id: Uuid,
    pub scope: TargetScope,
    pub kind: ValidationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_context: Option<String>,
    #[serde(default)]
    pub code_snippets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryRef>,
    /// Requirement text per checklist item id, when the caller supplies it.
    #[serde(default)]
    pub item_requirements: HashMap<String, String>,
    /// Focus areas to analyze for application-wide scope.
    #[serde(default)]
    pub focus_areas: Vec<String>,
    /// Integration checks requested, in order.
    #[serde(default)]
    pub integrations: Vec<String>,
    /// Configuration per requested integration. A requested integration with
    /// no configuration yields a skipped placeholder step.
    #[serde(default)]
    pub integration_configs: HashMap<String, IntegrationConfig>,
    pub created_at: DateTime<Utc>,
}

/// What one unit of work within a workflow does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Validate one checklist item (single-item and batch scopes).
    ItemCheck { checklist_item_id: String },
    /// Analyze one focus area of the repository (application scope).
    Analysis { focus_area: String },
    /// Run one configured external integration check.
    Integration { integration_id: String },
}

impl StepKind {
    pub fn label(&self) -> String {
        match self {
            StepKind::ItemCheck { checklist_item_id } => format!("item:{checklist_item_id}"),
            StepKind::Analysis { focus_area } => format!("analysis:{focus_area}"),
            StepKind::Integration { integration_id } => format!("integration:{integration_id}"),
        }
    }

    /// Focus-area analysis cannot run without repository evidence; item
    /// checks can fall back to inline evidence and integrations never touch
    /// the repository.
    pub fn needs_repository(&self) -> bool {
        matches!(self, StepKind::Analysis { .. })
    }
}

/// One unit of work within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub kind: StepKind,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
    /// Opaque structured payload kept for audit; the engine only contracts
    /// for the fields it extracts.
    pub details: Option<serde_json::Value>,
    /// Set if and only if the step failed.
    pub error_message: Option<String>,
    pub integration_source: Option<String>,
    /// Compliance sub-verdict, set when the step completed.
    pub compliant: Option<bool>,
}

impl Step {
    pub fn queued(workflow_id: Uuid, kind: StepKind) -> Self {
        let integration_source = match &kind {
            StepKind::Integration { integration_id } => Some(integration_id.clone()),
            _ => None,
        };
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            kind,
            status: StepStatus::Queued,
            started_at: None,
            completed_at: None,
            result_summary: None,
            details: None,
            error_message: None,
            integration_source,
            compliant: None,
        }
    }

    pub fn skipped(workflow_id: Uuid, kind: StepKind, reason: impl Into<String>) -> Self {
        let mut step = Self::queued(workflow_id, kind);
        step.status = StepStatus::Skipped;
        step.completed_at = Some(Utc::now());
        step.result_summary = Some(reason.into());
        step
    }
}

/// The execution instance tracking one validation request from submission to
/// terminal state. Owns its ordered step list, fixed at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub request_id: Uuid,
    pub application_id: Option<String>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub repository_url: Option<String>,
    /// Set if and only if the workflow completed.
    pub overall_compliance: Option<bool>,
    pub summary: Option<String>,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn new(id: Uuid, request: &ValidationRequest, steps: Vec<Step>) -> Self {
        Self {
            id,
            request_id: request.id,
            application_id: request.scope.application_id().map(str::to_string),
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            repository_url: request.repository.as_ref().map(|r| r.url.clone()),
            overall_compliance: None,
            summary: None,
            steps,
        }
    }
}

/// The durable, item-scoped outcome of a validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub id: Uuid,
    pub request_id: Uuid,
    pub workflow_id: Uuid,
    pub checklist_item_id: String,
    pub status: WorkflowStatus,
    pub is_compliant: Option<bool>,
    pub kind: ValidationKind,
    pub source: SourceKind,
    pub started_at: DateTime<Utc>,
    pub completion_timestamp: Option<DateTime<Utc>>,
    pub evidence_url: Option<String>,
    pub summary: Option<String>,
    pub findings: Vec<Finding>,
    /// Raw collaborator payload kept for audit.
    pub raw_response: Option<serde_json::Value>,
}

impl ValidationResult {
    pub fn pending(
        request: &ValidationRequest,
        workflow_id: Uuid,
        checklist_item_id: &str,
        source: SourceKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id: request.id,
            workflow_id,
            checklist_item_id: checklist_item_id.to_string(),
            status: WorkflowStatus::Pending,
            is_compliant: None,
            kind: request.kind,
            source,
            started_at: Utc::now(),
            completion_timestamp: None,
            evidence_url: None,
            summary: None,
            findings: Vec::new(),
            raw_response: None,
        }
    }
}

/// Pick the most recent completed result. Results without a completion
/// timestamp are not yet complete and never win.
pub fn latest_completed(results: &[ValidationResult]) -> Option<&ValidationResult> {
    results
        .iter()
        .filter(|r| r.completion_timestamp.is_some())
        .max_by_key(|r| r.completion_timestamp)
}

/// One discrete observation within a validation result. Immutable once
/// created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub description: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

impl Finding {
    pub fn new(description: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            severity,
            code_location: None,
            recommendation: None,
        }
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendation = Some(recommendation.into());
        self
    }
}

/// The terminal outcome of executing one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub compliant: Option<bool>,
    pub summary: String,
    pub findings: Vec<Finding>,
    pub details: serde_json::Value,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn completed(compliant: bool, summary: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Completed,
            compliant: Some(compliant),
            summary: summary.into(),
            findings: Vec::new(),
            details: serde_json::Value::Null,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            status: StepStatus::Failed,
            compliant: None,
            summary: format!("Step failed: {error}"),
            findings: Vec::new(),
            details: serde_json::Value::Null,
            error: Some(error),
        }
    }

    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = findings;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
