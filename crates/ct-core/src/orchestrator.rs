//! Workflow orchestrator
//!
//! Owns the workflow state machine: accepts validation requests, derives and
//! schedules steps, aggregates step outcomes into an overall compliance
//! verdict, and exposes the polling/cancellation surface. Step failures are
//! contained per step; the workflow fails only when nothing completed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::executor::{StepContext, StepExecutor};
use crate::model::{
    SourceKind, Step, StepKind, StepOutcome, StepStatus, TargetScope, ValidationKind,
    ValidationRequest, ValidationResult, Workflow, WorkflowStatus,
};
use crate::store::{ResultStore, StoreError};
use crate::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bound on one step execution.
    pub step_timeout: Duration,
    /// Bound on total elapsed time for one workflow's steps.
    pub workflow_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(120),
            workflow_timeout: Duration::from_secs(600),
        }
    }
}

/// What a caller gets back immediately after submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub workflow_id: Uuid,
    /// Per-item validation result ids, in the order the request named the
    /// checklist items.
    pub result_ids: Vec<Uuid>,
    pub status: WorkflowStatus,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn ResultStore>,
    executor: Arc<StepExecutor>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ResultStore>,
        executor: Arc<StepExecutor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Accept a validation request: persist the workflow in `pending`, kick
    /// off background step execution, and return immediately.
    pub async fn submit(&self, request: ValidationRequest) -> CoreResult<Submission> {
        if request.scope.is_empty() {
            return Err(CoreError::InvalidRequest(
                "target scope is empty".to_string(),
            ));
        }

        let workflow_id = Uuid::new_v4();
        let steps = derive_steps(workflow_id, &request)?;
        let workflow = Workflow::new(workflow_id, &request, steps);

        info!(
            workflow_id = %workflow_id,
            steps = workflow.steps.len(),
            kind = request.kind.as_str(),
            "validation workflow submitted"
        );

        self.store.create_request(&request).await?;
        self.store.create_workflow(&workflow).await?;

        let source = source_for_kind(request.kind);
        let mut result_ids = Vec::new();
        for item_id in request.scope.checklist_item_ids() {
            let result = ValidationResult::pending(&request, workflow_id, item_id, source);
            result_ids.push(result.id);
            self.store.create_result(&result).await?;
        }

        let driver = self.clone();
        tokio::spawn(driver.run_workflow(workflow, request));

        Ok(Submission {
            workflow_id,
            result_ids,
            status: WorkflowStatus::Pending,
        })
    }

    /// Background driver: runs every queued step concurrently, bounded by the
    /// workflow timeout, then aggregates and persists the terminal state.
    async fn run_workflow(self, workflow: Workflow, request: ValidationRequest) {
        let workflow_id = workflow.id;
        match self
            .store
            .transition_workflow(workflow_id, WorkflowStatus::InProgress)
            .await
        {
            Ok(()) => {}
            Err(StoreError::IllegalTransition { .. }) | Err(StoreError::NotFound) => {
                // Cancelled or deleted before the driver got started.
                debug!(workflow_id = %workflow_id, "workflow no longer runnable, driver exiting");
                return;
            }
            Err(err) => {
                error!(workflow_id = %workflow_id, %err, "failed to start workflow");
                return;
            }
        }
        self.mark_results_in_progress(workflow_id).await;

        let ctx = StepContext::from_request(&request, self.config.step_timeout);
        let mut tasks = JoinSet::new();
        for step in workflow
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Queued)
            .cloned()
        {
            let store = self.store.clone();
            let executor = self.executor.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                if let Err(err) = store.mark_step_running(step.id).await {
                    debug!(step = %step.kind.label(), %err, "step not runnable");
                    return None;
                }
                let outcome = executor.execute(&step, &ctx).await;
                if let Err(err) = store.finish_step(step.id, &outcome).await {
                    warn!(step = %step.kind.label(), %err, "failed to persist step outcome");
                }
                Some((step, outcome))
            });
        }

        // Completion order is irrelevant; aggregation commutes.
        let mut outcomes: HashMap<Uuid, StepOutcome> = HashMap::new();
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Some((step, outcome))) => {
                        outcomes.insert(step.id, outcome);
                    }
                    Ok(None) => {}
                    Err(err) if err.is_panic() => {
                        warn!(workflow_id = %workflow_id, "step task panicked");
                    }
                    Err(_) => {}
                }
            }
        };
        let timed_out = timeout(self.config.workflow_timeout, drain).await.is_err();
        let close_note = if timed_out {
            tasks.abort_all();
            let note = format!(
                "workflow timed out after {}s",
                self.config.workflow_timeout.as_secs()
            );
            warn!(workflow_id = %workflow_id, "{note}");
            note
        } else {
            // A step can also end up stranded when its own persistence calls
            // fail; it must read as a failure, not silently drop out of the
            // aggregate.
            "step did not record an outcome".to_string()
        };
        match self
            .store
            .close_live_steps(workflow_id, StepStatus::Failed, &close_note)
            .await
        {
            Ok(0) => {}
            Ok(closed) => {
                warn!(workflow_id = %workflow_id, closed, "closed steps without a recorded outcome")
            }
            Err(err) => {
                error!(workflow_id = %workflow_id, %err, "failed to close unfinished steps")
            }
        }

        // Reload for aggregation, distinguishing a deleted workflow from a
        // transient read failure.
        let mut current = None;
        for attempt in 0u32..3 {
            match self.store.workflow(workflow_id).await {
                Ok(Some(workflow)) => {
                    current = Some(workflow);
                    break;
                }
                Ok(None) => {
                    debug!(workflow_id = %workflow_id, "workflow deleted before aggregation");
                    return;
                }
                Err(err) => {
                    error!(workflow_id = %workflow_id, %err, attempt, "failed to reload workflow for aggregation");
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
        let Some(current) = current else {
            error!(workflow_id = %workflow_id, "giving up on aggregation, workflow left unfinished");
            return;
        };

        let (status, overall, summary) = aggregate_steps(&current.steps);
        match self
            .store
            .finish_workflow(workflow_id, status, overall, &summary)
            .await
        {
            Ok(()) => {
                info!(
                    workflow_id = %workflow_id,
                    status = status.as_str(),
                    compliant = ?overall,
                    "workflow finished: {summary}"
                );
            }
            Err(StoreError::IllegalTransition { .. }) => {
                // Cancellation won the race; it has already settled results.
                debug!(workflow_id = %workflow_id, "workflow already terminal, aggregation dropped");
                return;
            }
            Err(err) => {
                error!(workflow_id = %workflow_id, %err, "failed to finish workflow");
                return;
            }
        }

        self.finalize_results(&current, &request, status, overall, &summary, &outcomes)
            .await;
    }

    async fn mark_results_in_progress(&self, workflow_id: Uuid) {
        let results = match self.store.results_for_workflow(workflow_id).await {
            Ok(results) => results,
            Err(err) => {
                warn!(workflow_id = %workflow_id, %err, "failed to load results");
                return;
            }
        };
        for mut result in results {
            if result.status == WorkflowStatus::Pending {
                result.status = WorkflowStatus::InProgress;
                match self.store.update_result(&result).await {
                    Ok(()) => {}
                    // A concurrent cancel already settled this result.
                    Err(StoreError::IllegalTransition { .. }) => {}
                    Err(err) => {
                        warn!(result_id = %result.id, %err, "failed to mark result in progress")
                    }
                }
            }
        }
    }

    /// Fold terminal step state back into the per-item validation results.
    async fn finalize_results(
        &self,
        workflow: &Workflow,
        request: &ValidationRequest,
        status: WorkflowStatus,
        overall: Option<bool>,
        summary: &str,
        outcomes: &HashMap<Uuid, StepOutcome>,
    ) {
        let results = match self.store.results_for_workflow(workflow.id).await {
            Ok(results) => results,
            Err(err) => {
                warn!(workflow_id = %workflow.id, %err, "failed to load results for finalize");
                return;
            }
        };
        let evidence_url = request.repository.as_ref().map(|r| r.evidence_url());

        for mut result in results {
            if result.status.is_terminal() {
                continue;
            }
            let item_step = workflow.steps.iter().find(|s| {
                matches!(&s.kind, StepKind::ItemCheck { checklist_item_id }
                    if *checklist_item_id == result.checklist_item_id)
            });
            match item_step {
                Some(step) => {
                    let findings = outcomes
                        .get(&step.id)
                        .map(|o| o.findings.clone())
                        .unwrap_or_default();
                    match step.status {
                        StepStatus::Completed => {
                            result.status = WorkflowStatus::Completed;
                            result.is_compliant = step.compliant;
                            result.summary = step.result_summary.clone();
                        }
                        StepStatus::Failed => {
                            result.status = WorkflowStatus::Failed;
                            result.summary = step.error_message.clone();
                        }
                        // A skipped item check never produced a verdict.
                        _ => {
                            result.status = WorkflowStatus::Failed;
                            result.summary = step.result_summary.clone();
                        }
                    }
                    result.findings = findings;
                    result.raw_response = step.details.clone();
                }
                None => {
                    // Application-scope item: it gets the workflow verdict and
                    // the union of step findings.
                    result.status = status;
                    result.is_compliant = if status == WorkflowStatus::Completed {
                        overall
                    } else {
                        None
                    };
                    result.summary = Some(summary.to_string());
                    result.findings = workflow
                        .steps
                        .iter()
                        .filter_map(|s| outcomes.get(&s.id))
                        .flat_map(|o| o.findings.clone())
                        .collect();
                }
            }
            result.completion_timestamp = Some(Utc::now());
            result.evidence_url = evidence_url.clone();
            match self.store.update_result(&result).await {
                Ok(()) => {}
                Err(StoreError::IllegalTransition { .. }) => {}
                Err(err) => warn!(result_id = %result.id, %err, "failed to finalize result"),
            }
        }
    }

    /// Current workflow state, read fresh from the store.
    pub async fn get_status(&self, workflow_id: Uuid) -> CoreResult<Workflow> {
        self.store
            .workflow(workflow_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("workflow {workflow_id}")))
    }

    /// Most recent workflow for an application. `None` means the application
    /// has never been validated; it is not an error.
    pub async fn latest_for_application(
        &self,
        application_id: &str,
    ) -> CoreResult<Option<Workflow>> {
        Ok(self
            .store
            .latest_workflow_for_application(application_id)
            .await?)
    }

    /// Cancel a live workflow: queued/running steps become skipped and the
    /// workflow fails with a cancellation note. No-op on terminal workflows.
    pub async fn cancel(&self, workflow_id: Uuid) -> CoreResult<Workflow> {
        const NOTE: &str = "validation cancelled by user";

        let workflow = self.get_status(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Ok(workflow);
        }

        self.store
            .close_live_steps(workflow_id, StepStatus::Skipped, NOTE)
            .await?;
        match self
            .store
            .finish_workflow(workflow_id, WorkflowStatus::Failed, None, NOTE)
            .await
        {
            Ok(()) => info!(workflow_id = %workflow_id, "workflow cancelled"),
            // The driver finished in between; its outcome stands.
            Err(StoreError::IllegalTransition { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        for mut result in self.store.results_for_workflow(workflow_id).await? {
            if !result.status.is_terminal() {
                result.status = WorkflowStatus::Failed;
                result.summary = Some(NOTE.to_string());
                result.completion_timestamp = Some(Utc::now());
                match self.store.update_result(&result).await {
                    Ok(()) => {}
                    // The driver settled this result first; its verdict stands.
                    Err(StoreError::IllegalTransition { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        self.get_status(workflow_id).await
    }
}

fn source_for_kind(kind: ValidationKind) -> SourceKind {
    match kind {
        ValidationKind::Manual => SourceKind::User,
        ValidationKind::Automated => SourceKind::ExternalSystem,
        ValidationKind::AiAssisted => SourceKind::Ai,
    }
}

/// Derive the fixed step list for a request. Preconditions that cannot be
/// met at submission time either reject the request or produce skipped
/// placeholder steps, depending on whether any runnable work remains.
fn derive_steps(workflow_id: Uuid, request: &ValidationRequest) -> CoreResult<Vec<Step>> {
    let mut steps = Vec::new();
    match &request.scope {
        TargetScope::Item { checklist_item_id } => {
            steps.push(Step::queued(
                workflow_id,
                StepKind::ItemCheck {
                    checklist_item_id: checklist_item_id.clone(),
                },
            ));
        }
        TargetScope::Batch { checklist_item_ids } => {
            for item_id in checklist_item_ids {
                steps.push(Step::queued(
                    workflow_id,
                    StepKind::ItemCheck {
                        checklist_item_id: item_id.clone(),
                    },
                ));
            }
        }
        TargetScope::Application { .. } => {
            if !request.focus_areas.is_empty() && request.repository.is_none() {
                return Err(CoreError::InvalidRequest(
                    "application-wide validation requires a repository reference".to_string(),
                ));
            }
            for focus_area in &request.focus_areas {
                steps.push(Step::queued(
                    workflow_id,
                    StepKind::Analysis {
                        focus_area: focus_area.clone(),
                    },
                ));
            }
            for integration_id in &request.integrations {
                let kind = StepKind::Integration {
                    integration_id: integration_id.clone(),
                };
                if request.integration_configs.contains_key(integration_id) {
                    steps.push(Step::queued(workflow_id, kind));
                } else {
                    steps.push(Step::skipped(
                        workflow_id,
                        kind,
                        format!("skipped: integration {integration_id} not configured"),
                    ));
                }
            }
        }
    }
    if steps.is_empty() {
        return Err(CoreError::InvalidRequest(
            "request derives no validation steps".to_string(),
        ));
    }
    Ok(steps)
}

/// Commutative reduction over terminal step states.
///
/// The workflow fails only when zero steps completed; otherwise it completes
/// and the verdict is compliant exactly when every non-skipped step completed
/// with a compliant sub-verdict. Skipped steps count on neither side. A step
/// still queued or running at this point never recorded an outcome and counts
/// as a failure.
fn aggregate_steps(steps: &[Step]) -> (WorkflowStatus, Option<bool>, String) {
    let skipped = steps
        .iter()
        .filter(|s| s.status == StepStatus::Skipped)
        .count();
    let failed = steps
        .iter()
        .filter(|s| s.status == StepStatus::Failed || !s.status.is_terminal())
        .count();
    let completed = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .count();
    let compliant = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed && s.compliant == Some(true))
        .count();
    let ran = steps.len() - skipped;

    if completed == 0 {
        let summary = format!(
            "validation failed: no steps completed ({failed} failed, {skipped} skipped)"
        );
        (WorkflowStatus::Failed, None, summary)
    } else {
        let overall = failed == 0 && compliant == completed;
        let summary = format!(
            "{completed} of {ran} steps completed, {failed} failed, {skipped} skipped"
        );
        (WorkflowStatus::Completed, Some(overall), summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        AnalysisEngine, AnalysisError, AnalysisReport, CheckOutcome, CheckStatus, EvidenceBundle,
        EvidenceFetcher, FetchError, IntegrationCheck, IntegrationClient, IntegrationError,
        RepoFile,
    };
    use crate::model::{Finding, IntegrationConfig, RepositoryRef, Severity};
    use crate::store::{MemoryStore, StoreResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum EngineBehavior {
        Compliant,
        NonCompliant,
        Fail,
        Hang,
    }

    struct ScriptedEngine {
        default: EngineBehavior,
        per_focus: HashMap<String, EngineBehavior>,
    }

    impl ScriptedEngine {
        fn new(default: EngineBehavior) -> Self {
            Self {
                default,
                per_focus: HashMap::new(),
            }
        }

        fn with(mut self, focus: &str, behavior: EngineBehavior) -> Self {
            self.per_focus.insert(focus.to_string(), behavior);
            self
        }
    }

    #[async_trait]
    impl AnalysisEngine for ScriptedEngine {
        async fn analyze(
            &self,
            focus_area: &str,
            _evidence: &EvidenceBundle,
        ) -> Result<AnalysisReport, AnalysisError> {
            let behavior = self
                .per_focus
                .get(focus_area)
                .copied()
                .unwrap_or(self.default);
            match behavior {
                EngineBehavior::Compliant => Ok(AnalysisReport {
                    compliant: true,
                    confidence: Some("high".to_string()),
                    summary: format!("{focus_area} checks passed"),
                    findings: Vec::new(),
                    raw: json!({"focus": focus_area}),
                }),
                EngineBehavior::NonCompliant => Ok(AnalysisReport {
                    compliant: false,
                    confidence: Some("high".to_string()),
                    summary: format!("{focus_area} checks found gaps"),
                    findings: vec![Finding::new(
                        format!("{focus_area} requirement unmet"),
                        Severity::Warning,
                    )],
                    raw: json!({"focus": focus_area}),
                }),
                EngineBehavior::Fail => {
                    Err(AnalysisError::Unavailable("engine offline".to_string()))
                }
                EngineBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(120)).await;
                    Err(AnalysisError::Timeout(120))
                }
            }
        }
    }

    enum FetcherBehavior {
        Files(Vec<RepoFile>),
        NotFound,
    }

    struct ScriptedFetcher(FetcherBehavior);

    #[async_trait]
    impl EvidenceFetcher for ScriptedFetcher {
        async fn fetch(&self, repo: &RepositoryRef) -> Result<Vec<RepoFile>, FetchError> {
            match &self.0 {
                FetcherBehavior::Files(files) => Ok(files.clone()),
                FetcherBehavior::NotFound => Err(FetchError::NotFound(repo.url.clone())),
            }
        }
    }

    struct ScriptedIntegration {
        statuses: HashMap<String, CheckStatus>,
    }

    #[async_trait]
    impl IntegrationClient for ScriptedIntegration {
        async fn run(&self, check: &IntegrationCheck) -> Result<CheckOutcome, IntegrationError> {
            match self.statuses.get(&check.integration_id) {
                Some(status) => Ok(CheckOutcome {
                    status: *status,
                    message: format!("{} check finished", check.integration_id),
                    detail: json!({}),
                }),
                None => Err(IntegrationError::Transport(format!(
                    "{} unreachable",
                    check.integration_id
                ))),
            }
        }
    }

    /// Delegates to a `MemoryStore` but fails the first N calls of selected
    /// operations, for exercising the driver's persistence error paths.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        mark_running_failures: AtomicUsize,
        workflow_read_failures: AtomicUsize,
    }

    impl FlakyStore {
        fn take(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl ResultStore for FlakyStore {
        async fn create_request(&self, request: &ValidationRequest) -> StoreResult<()> {
            self.inner.create_request(request).await
        }

        async fn create_workflow(&self, workflow: &Workflow) -> StoreResult<()> {
            self.inner.create_workflow(workflow).await
        }

        async fn workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>> {
            if Self::take(&self.workflow_read_failures) {
                return Err(StoreError::Backend("store offline".to_string()));
            }
            self.inner.workflow(id).await
        }

        async fn latest_workflow_for_application(
            &self,
            application_id: &str,
        ) -> StoreResult<Option<Workflow>> {
            self.inner.latest_workflow_for_application(application_id).await
        }

        async fn transition_workflow(&self, id: Uuid, to: WorkflowStatus) -> StoreResult<()> {
            self.inner.transition_workflow(id, to).await
        }

        async fn finish_workflow(
            &self,
            id: Uuid,
            status: WorkflowStatus,
            overall_compliance: Option<bool>,
            summary: &str,
        ) -> StoreResult<()> {
            self.inner
                .finish_workflow(id, status, overall_compliance, summary)
                .await
        }

        async fn delete_workflow(&self, id: Uuid) -> StoreResult<bool> {
            self.inner.delete_workflow(id).await
        }

        async fn mark_step_running(&self, step_id: Uuid) -> StoreResult<()> {
            if Self::take(&self.mark_running_failures) {
                return Err(StoreError::Backend("store offline".to_string()));
            }
            self.inner.mark_step_running(step_id).await
        }

        async fn finish_step(&self, step_id: Uuid, outcome: &StepOutcome) -> StoreResult<()> {
            self.inner.finish_step(step_id, outcome).await
        }

        async fn close_live_steps(
            &self,
            workflow_id: Uuid,
            status: StepStatus,
            note: &str,
        ) -> StoreResult<usize> {
            self.inner.close_live_steps(workflow_id, status, note).await
        }

        async fn create_result(&self, result: &ValidationResult) -> StoreResult<()> {
            self.inner.create_result(result).await
        }

        async fn update_result(&self, result: &ValidationResult) -> StoreResult<()> {
            self.inner.update_result(result).await
        }

        async fn result(&self, id: Uuid) -> StoreResult<Option<ValidationResult>> {
            self.inner.result(id).await
        }

        async fn results_for_item(
            &self,
            checklist_item_id: &str,
        ) -> StoreResult<Vec<ValidationResult>> {
            self.inner.results_for_item(checklist_item_id).await
        }

        async fn results_for_workflow(
            &self,
            workflow_id: Uuid,
        ) -> StoreResult<Vec<ValidationResult>> {
            self.inner.results_for_workflow(workflow_id).await
        }

        async fn delete_result(&self, id: Uuid) -> StoreResult<bool> {
            self.inner.delete_result(id).await
        }
    }

    fn build(
        engine: ScriptedEngine,
        fetcher: ScriptedFetcher,
        integrations: ScriptedIntegration,
    ) -> (Orchestrator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            build_over(store.clone(), engine, fetcher, integrations),
            store,
        )
    }

    fn build_over(
        store: Arc<dyn ResultStore>,
        engine: ScriptedEngine,
        fetcher: ScriptedFetcher,
        integrations: ScriptedIntegration,
    ) -> Orchestrator {
        let executor = Arc::new(StepExecutor::new(
            Arc::new(fetcher),
            Arc::new(engine),
            Arc::new(integrations),
        ));
        let config = OrchestratorConfig {
            step_timeout: Duration::from_millis(500),
            workflow_timeout: Duration::from_secs(5),
        };
        Orchestrator::new(store, executor, config)
    }

    fn default_build() -> (Orchestrator, Arc<MemoryStore>) {
        build(
            ScriptedEngine::new(EngineBehavior::Compliant),
            ScriptedFetcher(FetcherBehavior::Files(vec![RepoFile {
                path: "src/main.rs".to_string(),
                content: "fn main() {}".to_string(),
            }])),
            ScriptedIntegration {
                statuses: HashMap::new(),
            },
        )
    }

    fn base_request(scope: TargetScope) -> ValidationRequest {
        ValidationRequest {
            id: Uuid::new_v4(),
            scope,
            kind: ValidationKind::AiAssisted,
            evidence_context: None,
            code_snippets: Vec::new(),
            repository: None,
            item_requirements: HashMap::new(),
            focus_areas: Vec::new(),
            integrations: Vec::new(),
            integration_configs: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    fn repo() -> RepositoryRef {
        RepositoryRef {
            url: "https://github.com/org/app".to_string(),
            auth_token: None,
            commit_id: None,
        }
    }

    async fn wait_terminal(orchestrator: &Orchestrator, workflow_id: Uuid) -> Workflow {
        for _ in 0..200 {
            let workflow = orchestrator.get_status(workflow_id).await.unwrap();
            if workflow.status.is_terminal() {
                return workflow;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("workflow {workflow_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn single_item_with_inline_evidence_completes() {
        let (orchestrator, store) = default_build();
        let mut request = base_request(TargetScope::Item {
            checklist_item_id: "item-retry".to_string(),
        });
        request.evidence_context =
            Some("retry logic present in OrderService.retry()".to_string());

        let submission = orchestrator.submit(request).await.unwrap();
        assert_eq!(submission.status, WorkflowStatus::Pending);
        assert_eq!(submission.result_ids.len(), 1);

        let workflow = wait_terminal(&orchestrator, submission.workflow_id).await;
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(workflow.steps.len(), 1);
        assert_eq!(workflow.steps[0].status, StepStatus::Completed);
        assert_eq!(workflow.overall_compliance, Some(true));
        assert!(workflow.completed_at.is_some());

        let result = store
            .result(submission.result_ids[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.is_compliant, Some(true));
        assert!(result.completion_timestamp.is_some());
    }

    #[tokio::test]
    async fn batch_fetch_failure_fails_every_step_and_the_workflow() {
        let (orchestrator, store) = build(
            ScriptedEngine::new(EngineBehavior::Compliant),
            ScriptedFetcher(FetcherBehavior::NotFound),
            ScriptedIntegration {
                statuses: HashMap::new(),
            },
        );
        let mut request = base_request(TargetScope::Batch {
            checklist_item_ids: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        });
        request.repository = Some(repo());

        let submission = orchestrator.submit(request).await.unwrap();
        assert_eq!(submission.result_ids.len(), 3);

        let workflow = wait_terminal(&orchestrator, submission.workflow_id).await;
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert_eq!(workflow.overall_compliance, None);
        assert_eq!(workflow.steps.len(), 3);
        for step in &workflow.steps {
            assert_eq!(step.status, StepStatus::Failed);
            let error = step.error_message.as_deref().unwrap();
            assert!(error.contains("evidence fetch failed"), "{error}");
        }
        for result_id in submission.result_ids {
            let result = store.result(result_id).await.unwrap().unwrap();
            assert_eq!(result.status, WorkflowStatus::Failed);
            assert!(result.summary.unwrap().contains("fetch"));
        }
    }

    #[tokio::test]
    async fn partial_failure_still_completes_the_workflow() {
        let (orchestrator, _) = build(
            ScriptedEngine::new(EngineBehavior::Compliant)
                .with("security", EngineBehavior::Fail),
            ScriptedFetcher(FetcherBehavior::Files(Vec::new())),
            ScriptedIntegration {
                statuses: HashMap::new(),
            },
        );
        let mut request = base_request(TargetScope::Application {
            application_id: "app-1".to_string(),
            checklist_item_ids: Vec::new(),
        });
        request.repository = Some(repo());
        request.focus_areas = vec!["code_quality".to_string(), "security".to_string()];

        let submission = orchestrator.submit(request).await.unwrap();
        let workflow = wait_terminal(&orchestrator, submission.workflow_id).await;

        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(workflow.overall_compliance, Some(false));
        let by_focus = |focus: &str| {
            workflow
                .steps
                .iter()
                .find(|s| s.kind == StepKind::Analysis {
                    focus_area: focus.to_string(),
                })
                .unwrap()
        };
        assert_eq!(by_focus("code_quality").status, StepStatus::Completed);
        assert_eq!(by_focus("security").status, StepStatus::Failed);
        let summary = workflow.summary.unwrap();
        assert!(summary.contains("1 failed"), "{summary}");
    }

    #[tokio::test]
    async fn unknown_workflow_is_not_found() {
        let (orchestrator, _) = default_build();
        let err = orchestrator.get_status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_application_yields_none_not_error() {
        let (orchestrator, _) = default_build();
        let latest = orchestrator
            .latest_for_application("never-validated")
            .await
            .unwrap();
        assert!(latest.is_none());
    }

    #[tokio::test]
    async fn concurrent_submissions_complete_independently() {
        let (orchestrator, _) = build(
            ScriptedEngine::new(EngineBehavior::Compliant)
                .with("availability", EngineBehavior::NonCompliant),
            ScriptedFetcher(FetcherBehavior::Files(Vec::new())),
            ScriptedIntegration {
                statuses: HashMap::new(),
            },
        );

        let mut first = base_request(TargetScope::Application {
            application_id: "app-clean".to_string(),
            checklist_item_ids: Vec::new(),
        });
        first.repository = Some(repo());
        first.focus_areas = vec!["logging".to_string()];

        let mut second = base_request(TargetScope::Application {
            application_id: "app-gaps".to_string(),
            checklist_item_ids: Vec::new(),
        });
        second.repository = Some(repo());
        second.focus_areas = vec!["availability".to_string()];

        let (first_sub, second_sub) =
            tokio::join!(orchestrator.submit(first), orchestrator.submit(second));
        let first_sub = first_sub.unwrap();
        let second_sub = second_sub.unwrap();

        let first_wf = wait_terminal(&orchestrator, first_sub.workflow_id).await;
        let second_wf = wait_terminal(&orchestrator, second_sub.workflow_id).await;

        assert_eq!(first_wf.overall_compliance, Some(true));
        assert_eq!(second_wf.overall_compliance, Some(false));
        assert_eq!(first_wf.steps.len(), 1);
        assert_eq!(second_wf.steps.len(), 1);

        let latest = orchestrator
            .latest_for_application("app-clean")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, first_wf.id);
    }

    #[tokio::test]
    async fn unconfigured_integration_is_skipped_not_fatal() {
        let (orchestrator, _) = build(
            ScriptedEngine::new(EngineBehavior::Compliant),
            ScriptedFetcher(FetcherBehavior::Files(Vec::new())),
            ScriptedIntegration {
                statuses: HashMap::new(),
            },
        );
        let mut request = base_request(TargetScope::Application {
            application_id: "app-1".to_string(),
            checklist_item_ids: Vec::new(),
        });
        request.repository = Some(repo());
        request.focus_areas = vec!["logging".to_string()];
        request.integrations = vec!["jenkins".to_string()];

        let submission = orchestrator.submit(request).await.unwrap();
        let workflow = wait_terminal(&orchestrator, submission.workflow_id).await;

        assert_eq!(workflow.status, WorkflowStatus::Completed);
        // Skipped placeholder does not count against compliance.
        assert_eq!(workflow.overall_compliance, Some(true));
        let skipped = workflow
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Skipped)
            .unwrap();
        assert!(skipped
            .result_summary
            .as_deref()
            .unwrap()
            .contains("not configured"));
    }

    #[tokio::test]
    async fn configured_integration_outcomes_feed_the_aggregate() {
        let mut statuses = HashMap::new();
        statuses.insert("sonarqube".to_string(), CheckStatus::Success);
        let (orchestrator, _) = build(
            ScriptedEngine::new(EngineBehavior::Compliant),
            ScriptedFetcher(FetcherBehavior::Files(Vec::new())),
            ScriptedIntegration { statuses },
        );
        let mut request = base_request(TargetScope::Application {
            application_id: "app-1".to_string(),
            checklist_item_ids: Vec::new(),
        });
        request.integrations = vec!["sonarqube".to_string()];
        request.integration_configs.insert(
            "sonarqube".to_string(),
            IntegrationConfig {
                endpoint: "https://sonar.example.com/api/check".to_string(),
                auth_token: None,
                check_query: "project=app-1".to_string(),
                success_criteria: None,
            },
        );

        let submission = orchestrator.submit(request).await.unwrap();
        let workflow = wait_terminal(&orchestrator, submission.workflow_id).await;
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(workflow.overall_compliance, Some(true));
        assert_eq!(
            workflow.steps[0].integration_source.as_deref(),
            Some("sonarqube")
        );
    }

    #[tokio::test]
    async fn step_timeout_is_contained_to_the_step() {
        let (orchestrator, _) = build(
            ScriptedEngine::new(EngineBehavior::Compliant)
                .with("security", EngineBehavior::Hang),
            ScriptedFetcher(FetcherBehavior::Files(Vec::new())),
            ScriptedIntegration {
                statuses: HashMap::new(),
            },
        );
        let mut request = base_request(TargetScope::Application {
            application_id: "app-1".to_string(),
            checklist_item_ids: Vec::new(),
        });
        request.repository = Some(repo());
        request.focus_areas = vec!["logging".to_string(), "security".to_string()];

        let submission = orchestrator.submit(request).await.unwrap();
        let workflow = wait_terminal(&orchestrator, submission.workflow_id).await;

        assert_eq!(workflow.status, WorkflowStatus::Completed);
        let timed_out = workflow
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Failed)
            .unwrap();
        assert!(timed_out
            .error_message
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn unrecorded_step_counts_against_the_aggregate() {
        let inner = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore {
            inner: inner.clone(),
            mark_running_failures: AtomicUsize::new(1),
            workflow_read_failures: AtomicUsize::new(0),
        });
        let orchestrator = build_over(
            flaky,
            ScriptedEngine::new(EngineBehavior::Compliant),
            ScriptedFetcher(FetcherBehavior::Files(Vec::new())),
            ScriptedIntegration {
                statuses: HashMap::new(),
            },
        );
        let mut request = base_request(TargetScope::Application {
            application_id: "app-1".to_string(),
            checklist_item_ids: Vec::new(),
        });
        request.repository = Some(repo());
        request.focus_areas = vec!["logging".to_string(), "security".to_string()];

        let submission = orchestrator.submit(request).await.unwrap();
        let workflow = wait_terminal(&orchestrator, submission.workflow_id).await;

        // One step never started because the store refused the running mark;
        // it must read as a failure, not silently pass the aggregate.
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(workflow.overall_compliance, Some(false));
        let stuck = workflow
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Failed)
            .unwrap();
        assert!(stuck
            .error_message
            .as_deref()
            .unwrap()
            .contains("did not record an outcome"));
        assert!(workflow
            .steps
            .iter()
            .any(|s| s.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn aggregation_retries_transient_reload_failures() {
        let inner = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore {
            inner: inner.clone(),
            mark_running_failures: AtomicUsize::new(0),
            workflow_read_failures: AtomicUsize::new(2),
        });
        let orchestrator = build_over(
            flaky,
            ScriptedEngine::new(EngineBehavior::Compliant),
            ScriptedFetcher(FetcherBehavior::Files(Vec::new())),
            ScriptedIntegration {
                statuses: HashMap::new(),
            },
        );
        let mut request = base_request(TargetScope::Item {
            checklist_item_id: "item-1".to_string(),
        });
        request.evidence_context = Some("evidence".to_string());

        let submission = orchestrator.submit(request).await.unwrap();

        // Poll the backing store directly so the injected read failures are
        // consumed by the driver's reload, not by this loop.
        for _ in 0..200 {
            let workflow = inner
                .workflow(submission.workflow_id)
                .await
                .unwrap()
                .unwrap();
            if workflow.status.is_terminal() {
                assert_eq!(workflow.status, WorkflowStatus::Completed);
                assert_eq!(workflow.overall_compliance, Some(true));
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("workflow never finished despite the store recovering");
    }

    #[tokio::test]
    async fn cancel_skips_live_steps_and_fails_the_workflow() {
        let (orchestrator, store) = build(
            ScriptedEngine::new(EngineBehavior::Hang),
            ScriptedFetcher(FetcherBehavior::Files(Vec::new())),
            ScriptedIntegration {
                statuses: HashMap::new(),
            },
        );
        let mut request = base_request(TargetScope::Item {
            checklist_item_id: "item-1".to_string(),
        });
        request.evidence_context = Some("pending evidence".to_string());

        let submission = orchestrator.submit(request).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cancelled = orchestrator.cancel(submission.workflow_id).await.unwrap();
        assert_eq!(cancelled.status, WorkflowStatus::Failed);
        assert_eq!(cancelled.overall_compliance, None);
        assert!(cancelled
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Skipped));

        let result = store
            .result(submission.result_ids[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.summary.unwrap().contains("cancelled"));

        // Cancelling a terminal workflow is a no-op.
        let again = orchestrator.cancel(submission.workflow_id).await.unwrap();
        assert_eq!(again.status, WorkflowStatus::Failed);
        assert_eq!(
            again.completed_at, cancelled.completed_at,
            "terminal state must not move"
        );
    }

    #[tokio::test]
    async fn polling_is_idempotent() {
        let (orchestrator, _) = default_build();
        let mut request = base_request(TargetScope::Item {
            checklist_item_id: "item-1".to_string(),
        });
        request.evidence_context = Some("evidence".to_string());

        let submission = orchestrator.submit(request).await.unwrap();
        wait_terminal(&orchestrator, submission.workflow_id).await;

        let first = orchestrator.get_status(submission.workflow_id).await.unwrap();
        let second = orchestrator.get_status(submission.workflow_id).await.unwrap();
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_synchronously() {
        let (orchestrator, _) = default_build();

        let empty_batch = base_request(TargetScope::Batch {
            checklist_item_ids: Vec::new(),
        });
        assert!(matches!(
            orchestrator.submit(empty_batch).await.unwrap_err(),
            CoreError::InvalidRequest(_)
        ));

        let mut no_repo = base_request(TargetScope::Application {
            application_id: "app-1".to_string(),
            checklist_item_ids: Vec::new(),
        });
        no_repo.focus_areas = vec!["security".to_string()];
        assert!(matches!(
            orchestrator.submit(no_repo).await.unwrap_err(),
            CoreError::InvalidRequest(_)
        ));

        // Application scope deriving zero steps is rejected, not guessed at.
        let no_steps = base_request(TargetScope::Application {
            application_id: "app-1".to_string(),
            checklist_item_ids: Vec::new(),
        });
        assert!(matches!(
            orchestrator.submit(no_steps).await.unwrap_err(),
            CoreError::InvalidRequest(_)
        ));
    }

    #[test]
    fn aggregate_grid() {
        let workflow_id = Uuid::new_v4();
        let step = |status: StepStatus, compliant: Option<bool>| {
            let mut s = Step::queued(
                workflow_id,
                StepKind::Analysis {
                    focus_area: "logging".to_string(),
                },
            );
            s.status = status;
            s.compliant = compliant;
            if status == StepStatus::Failed {
                s.error_message = Some("boom".to_string());
            }
            s
        };

        // All compliant.
        let (status, overall, _) = aggregate_steps(&[
            step(StepStatus::Completed, Some(true)),
            step(StepStatus::Completed, Some(true)),
        ]);
        assert_eq!(status, WorkflowStatus::Completed);
        assert_eq!(overall, Some(true));

        // One non-compliant verdict flips the aggregate.
        let (status, overall, _) = aggregate_steps(&[
            step(StepStatus::Completed, Some(true)),
            step(StepStatus::Completed, Some(false)),
        ]);
        assert_eq!(status, WorkflowStatus::Completed);
        assert_eq!(overall, Some(false));

        // A failed sibling keeps the workflow completed but not compliant.
        let (status, overall, summary) = aggregate_steps(&[
            step(StepStatus::Completed, Some(true)),
            step(StepStatus::Failed, None),
        ]);
        assert_eq!(status, WorkflowStatus::Completed);
        assert_eq!(overall, Some(false));
        assert!(summary.contains("1 of 2 steps completed"), "{summary}");

        // Zero completions is total failure.
        let (status, overall, _) = aggregate_steps(&[
            step(StepStatus::Failed, None),
            step(StepStatus::Skipped, None),
        ]);
        assert_eq!(status, WorkflowStatus::Failed);
        assert_eq!(overall, None);

        // Skipped steps sit outside the aggregate entirely.
        let (status, overall, _) = aggregate_steps(&[
            step(StepStatus::Completed, Some(true)),
            step(StepStatus::Skipped, None),
        ]);
        assert_eq!(status, WorkflowStatus::Completed);
        assert_eq!(overall, Some(true));

        // A step stuck outside a terminal state counts as a failure, never
        // as an implicit success.
        let (status, overall, _) = aggregate_steps(&[
            step(StepStatus::Completed, Some(true)),
            step(StepStatus::Queued, None),
        ]);
        assert_eq!(status, WorkflowStatus::Completed);
        assert_eq!(overall, Some(false));

        let (status, overall, _) = aggregate_steps(&[step(StepStatus::Running, None)]);
        assert_eq!(status, WorkflowStatus::Failed);
        assert_eq!(overall, None);
    }
}
