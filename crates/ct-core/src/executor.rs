//! Step executor
//!
//! Runs one workflow step to completion and never lets a failure escape:
//! fetch errors, analysis errors, integration errors, and timeouts all come
//! back as a failed `StepOutcome` for the orchestrator to aggregate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::capabilities::{
    AnalysisEngine, CheckStatus, EvidenceBundle, EvidenceFetcher, IntegrationCheck,
    IntegrationClient, RepoFile,
};
use crate::model::{
    Finding, IntegrationConfig, RepositoryRef, Severity, Step, StepKind, StepOutcome,
    ValidationRequest,
};

/// Shared context for every step of one workflow, derived from the
/// originating request.
#[derive(Clone)]
pub struct StepContext {
    pub repository: Option<RepositoryRef>,
    pub evidence_context: Option<String>,
    pub code_snippets: Vec<String>,
    pub item_requirements: HashMap<String, String>,
    pub integration_configs: HashMap<String, IntegrationConfig>,
    pub step_timeout: Duration,
}

impl StepContext {
    pub fn from_request(request: &ValidationRequest, step_timeout: Duration) -> Self {
        Self {
            repository: request.repository.clone(),
            evidence_context: request.evidence_context.clone(),
            code_snippets: request.code_snippets.clone(),
            item_requirements: request.item_requirements.clone(),
            integration_configs: request.integration_configs.clone(),
            step_timeout,
        }
    }
}

pub struct StepExecutor {
    fetcher: Arc<dyn EvidenceFetcher>,
    engine: Arc<dyn AnalysisEngine>,
    integrations: Arc<dyn IntegrationClient>,
}

impl StepExecutor {
    pub fn new(
        fetcher: Arc<dyn EvidenceFetcher>,
        engine: Arc<dyn AnalysisEngine>,
        integrations: Arc<dyn IntegrationClient>,
    ) -> Self {
        Self {
            fetcher,
            engine,
            integrations,
        }
    }

    /// Execute one step to a terminal outcome, bounded by the per-step
    /// timeout.
    pub async fn execute(&self, step: &Step, ctx: &StepContext) -> StepOutcome {
        match timeout(ctx.step_timeout, self.run(step, ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(step = %step.kind.label(), "step timed out");
                StepOutcome::failed(format!(
                    "step timed out after {}s",
                    ctx.step_timeout.as_secs()
                ))
            }
        }
    }

    async fn run(&self, step: &Step, ctx: &StepContext) -> StepOutcome {
        match &step.kind {
            StepKind::ItemCheck { checklist_item_id } => {
                let requirement = ctx.item_requirements.get(checklist_item_id).cloned();
                self.run_analysis("requirement", requirement, ctx).await
            }
            StepKind::Analysis { focus_area } => self.run_analysis(focus_area, None, ctx).await,
            StepKind::Integration { integration_id } => {
                self.run_integration(integration_id, ctx).await
            }
        }
    }

    async fn run_analysis(
        &self,
        focus_area: &str,
        requirement: Option<String>,
        ctx: &StepContext,
    ) -> StepOutcome {
        let mut evidence = EvidenceBundle {
            requirement,
            context: ctx.evidence_context.clone(),
            code_snippets: ctx.code_snippets.clone(),
            files: Vec::new(),
        };

        let mut fetch_note = None;
        if let Some(repo) = &ctx.repository {
            match self.fetcher.fetch(repo).await {
                Ok(files) => {
                    debug!(focus_area, files = files.len(), "repository evidence fetched");
                    evidence.files = files;
                }
                Err(err) => {
                    // Inline evidence can still carry the analysis; with
                    // nothing else to go on the step fails.
                    if evidence.has_material() {
                        fetch_note = Some(err.to_string());
                    } else {
                        return StepOutcome::failed(format!(
                            "evidence fetch failed: {err}"
                        ));
                    }
                }
            }
        }

        match self.engine.analyze(focus_area, &evidence).await {
            Ok(report) => {
                let mut details = json!({
                    "focus_area": focus_area,
                    "confidence": report.confidence,
                    "analysis": report.raw,
                });
                if let Some(note) = fetch_note {
                    details["fetch_warning"] = json!(note);
                }
                StepOutcome {
                    status: crate::model::StepStatus::Completed,
                    compliant: Some(report.compliant),
                    summary: report.summary,
                    findings: report.findings,
                    details,
                    error: None,
                }
            }
            Err(err) => StepOutcome::failed(format!("analysis failed: {err}")),
        }
    }

    async fn run_integration(&self, integration_id: &str, ctx: &StepContext) -> StepOutcome {
        let Some(config) = ctx.integration_configs.get(integration_id) else {
            // Unconfigured integrations become skipped placeholders at
            // derivation time; reaching this point means the config vanished.
            return StepOutcome::failed(format!(
                "integration {integration_id} is not configured"
            ));
        };
        let check = IntegrationCheck {
            integration_id: integration_id.to_string(),
            config: config.clone(),
        };

        match self.integrations.run(&check).await {
            Ok(outcome) => match outcome.status {
                CheckStatus::Success => StepOutcome::completed(true, outcome.message)
                    .with_details(json!({ "integration": integration_id, "result": outcome.detail })),
                CheckStatus::Failure => {
                    let finding = Finding::new(
                        format!("integration check {integration_id} reported failure"),
                        Severity::Error,
                    )
                    .with_recommendation(format!(
                        "Review {integration_id} configuration and the reported detail"
                    ));
                    StepOutcome::completed(false, outcome.message)
                        .with_findings(vec![finding])
                        .with_details(
                            json!({ "integration": integration_id, "result": outcome.detail }),
                        )
                }
                CheckStatus::Error => StepOutcome::failed(format!(
                    "integration {integration_id} errored: {}",
                    outcome.message
                )),
            },
            Err(err) => StepOutcome::failed(format!(
                "integration {integration_id} check failed: {err}"
            )),
        }
    }
}
