//! Postgres-backed result store
//!
//! Mirrors the in-memory store's semantics on top of sqlx. Status guards run
//! as conditional UPDATEs so concurrent closers cannot overwrite a terminal
//! state; steps and findings cascade with their owners via their foreign
//! keys.

use async_trait::async_trait;
use ct_core::model::{
    Finding, Severity, SourceKind, Step, StepKind, StepOutcome, StepStatus, ValidationKind,
    ValidationRequest, ValidationResult, Workflow, WorkflowStatus,
};
use ct_core::store::{ResultStore, StoreError, StoreResult};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn steps_for_workflow(&self, workflow_id: Uuid) -> StoreResult<Vec<Step>> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, kind, status, started_at, completed_at, result_summary, \
             details, error_message, integration_source, compliant \
             FROM workflow_steps WHERE workflow_id = $1 ORDER BY position",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(step_from_row).collect()
    }

    async fn load_workflow(&self, row: PgRow) -> StoreResult<Workflow> {
        let id: Uuid = row.try_get("id").map_err(backend)?;
        let steps = self.steps_for_workflow(id).await?;
        workflow_from_row(&row, steps)
    }

    async fn current_workflow_status(&self, id: Uuid) -> StoreResult<WorkflowStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflows WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        let status = status.ok_or(StoreError::NotFound)?;
        parse_workflow_status(&status)
    }

    async fn findings_for_result(&self, result_id: Uuid) -> StoreResult<Vec<Finding>> {
        let rows = sqlx::query(
            "SELECT id, description, severity, code_location, recommendation \
             FROM result_findings WHERE result_id = $1 ORDER BY position",
        )
        .bind(result_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(finding_from_row).collect()
    }

    async fn load_result(&self, row: PgRow) -> StoreResult<ValidationResult> {
        let id: Uuid = row.try_get("id").map_err(backend)?;
        let findings = self.findings_for_result(id).await?;
        result_from_row(&row, findings)
    }

    async fn insert_findings(&self, result_id: Uuid, findings: &[Finding]) -> StoreResult<()> {
        for (position, finding) in findings.iter().enumerate() {
            sqlx::query(
                "INSERT INTO result_findings \
                 (id, result_id, position, description, severity, code_location, recommendation) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(finding.id)
            .bind(result_id)
            .bind(position as i32)
            .bind(&finding.description)
            .bind(finding.severity.as_str())
            .bind(&finding.code_location)
            .bind(&finding.recommendation)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for PgStore {
    async fn create_request(&self, request: &ValidationRequest) -> StoreResult<()> {
        let payload = serde_json::to_value(request).map_err(|e| backend_msg(e.to_string()))?;
        sqlx::query("INSERT INTO validation_requests (id, payload, created_at) VALUES ($1, $2, $3)")
            .bind(request.id)
            .bind(payload)
            .bind(request.created_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn create_workflow(&self, workflow: &Workflow) -> StoreResult<()> {
        // Workflow and steps land together or not at all; a half-created
        // workflow would confuse pollers.
        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query(
            "INSERT INTO workflows \
             (id, request_id, application_id, status, created_at, completed_at, repository_url, \
              overall_compliance, summary) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(workflow.id)
        .bind(workflow.request_id)
        .bind(&workflow.application_id)
        .bind(workflow.status.as_str())
        .bind(workflow.created_at)
        .bind(workflow.completed_at)
        .bind(&workflow.repository_url)
        .bind(workflow.overall_compliance)
        .bind(&workflow.summary)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        for (position, step) in workflow.steps.iter().enumerate() {
            let kind = serde_json::to_value(&step.kind).map_err(|e| backend_msg(e.to_string()))?;
            sqlx::query(
                "INSERT INTO workflow_steps \
                 (id, workflow_id, position, kind, status, started_at, completed_at, \
                  result_summary, details, error_message, integration_source, compliant) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(step.id)
            .bind(workflow.id)
            .bind(position as i32)
            .bind(kind)
            .bind(step.status.as_str())
            .bind(step.started_at)
            .bind(step.completed_at)
            .bind(&step.result_summary)
            .bind(step.details.clone())
            .bind(&step.error_message)
            .bind(&step.integration_source)
            .bind(step.compliant)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)
    }

    async fn workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => Ok(Some(self.load_workflow(row).await?)),
            None => Ok(None),
        }
    }

    async fn latest_workflow_for_application(
        &self,
        application_id: &str,
    ) -> StoreResult<Option<Workflow>> {
        let row = sqlx::query(
            "SELECT * FROM workflows WHERE application_id = $1 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(application_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            Some(row) => Ok(Some(self.load_workflow(row).await?)),
            None => Ok(None),
        }
    }

    async fn transition_workflow(&self, id: Uuid, to: WorkflowStatus) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE workflows SET status = $2 WHERE id = $1 AND status = ANY($3)",
        )
        .bind(id)
        .bind(to.as_str())
        .bind(allowed_froms(to))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if updated.rows_affected() == 0 {
            let from = self.current_workflow_status(id).await?;
            return Err(StoreError::IllegalTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    async fn finish_workflow(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        overall_compliance: Option<bool>,
        summary: &str,
    ) -> StoreResult<()> {
        let overall = if status == WorkflowStatus::Completed {
            overall_compliance
        } else {
            None
        };
        let updated = sqlx::query(
            "UPDATE workflows SET status = $2, overall_compliance = $3, summary = $4, \
             completed_at = NOW() WHERE id = $1 AND status = ANY($5)",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(overall)
        .bind(summary)
        .bind(allowed_froms(status))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if updated.rows_affected() == 0 {
            let from = self.current_workflow_status(id).await?;
            return Err(StoreError::IllegalTransition {
                from: from.to_string(),
                to: status.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_workflow(&self, id: Uuid) -> StoreResult<bool> {
        let deleted = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn mark_step_running(&self, step_id: Uuid) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE workflow_steps SET status = 'running', started_at = NOW() \
             WHERE id = $1 AND status = 'queued'",
        )
        .bind(step_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if updated.rows_affected() == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM workflow_steps WHERE id = $1")
                    .bind(step_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(backend)?;
            let from = current.ok_or(StoreError::NotFound)?;
            return Err(StoreError::IllegalTransition {
                from,
                to: StepStatus::Running.to_string(),
            });
        }
        Ok(())
    }

    async fn finish_step(&self, step_id: Uuid, outcome: &StepOutcome) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE workflow_steps SET status = $2, completed_at = NOW(), result_summary = $3, \
             details = $4, error_message = $5, compliant = $6 \
             WHERE id = $1 AND status IN ('queued', 'running')",
        )
        .bind(step_id)
        .bind(outcome.status.as_str())
        .bind(&outcome.summary)
        .bind(outcome.details.clone())
        .bind(&outcome.error)
        .bind(outcome.compliant)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if updated.rows_affected() == 0 {
            let exists: Option<Uuid> =
                sqlx::query_scalar("SELECT id FROM workflow_steps WHERE id = $1")
                    .bind(step_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(backend)?;
            // Terminal already; a concurrent closer settled this step.
            return exists.map(|_| ()).ok_or(StoreError::NotFound);
        }
        Ok(())
    }

    async fn close_live_steps(
        &self,
        workflow_id: Uuid,
        status: StepStatus,
        note: &str,
    ) -> StoreResult<usize> {
        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM workflows WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        if exists.is_none() {
            return Err(StoreError::NotFound);
        }
        let query = if status == StepStatus::Failed {
            "UPDATE workflow_steps SET status = $2, completed_at = NOW(), error_message = $3 \
             WHERE workflow_id = $1 AND status IN ('queued', 'running')"
        } else {
            "UPDATE workflow_steps SET status = $2, completed_at = NOW(), result_summary = $3 \
             WHERE workflow_id = $1 AND status IN ('queued', 'running')"
        };
        let updated = sqlx::query(query)
            .bind(workflow_id)
            .bind(status.as_str())
            .bind(note)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(updated.rows_affected() as usize)
    }

    async fn create_result(&self, result: &ValidationResult) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO validation_results \
             (id, request_id, workflow_id, checklist_item_id, status, is_compliant, kind, \
              source, started_at, completion_timestamp, evidence_url, summary, raw_response) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(result.id)
        .bind(result.request_id)
        .bind(result.workflow_id)
        .bind(&result.checklist_item_id)
        .bind(result.status.as_str())
        .bind(result.is_compliant)
        .bind(result.kind.as_str())
        .bind(result.source.as_str())
        .bind(result.started_at)
        .bind(result.completion_timestamp)
        .bind(&result.evidence_url)
        .bind(&result.summary)
        .bind(result.raw_response.clone())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        self.insert_findings(result.id, &result.findings).await
    }

    async fn update_result(&self, result: &ValidationResult) -> StoreResult<()> {
        // A settled result only accepts writes that keep its terminal status;
        // a stale in-flight update loses the race instead of reviving it.
        let updated = sqlx::query(
            "UPDATE validation_results SET status = $2, is_compliant = $3, \
             completion_timestamp = $4, evidence_url = $5, summary = $6, raw_response = $7 \
             WHERE id = $1 AND (status NOT IN ('completed', 'failed') OR status = $2)",
        )
        .bind(result.id)
        .bind(result.status.as_str())
        .bind(result.is_compliant)
        .bind(result.completion_timestamp)
        .bind(&result.evidence_url)
        .bind(&result.summary)
        .bind(result.raw_response.clone())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if updated.rows_affected() == 0 {
            let from: Option<String> =
                sqlx::query_scalar("SELECT status FROM validation_results WHERE id = $1")
                    .bind(result.id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(backend)?;
            let from = from.ok_or(StoreError::NotFound)?;
            return Err(StoreError::IllegalTransition {
                from,
                to: result.status.as_str().to_string(),
            });
        }
        sqlx::query("DELETE FROM result_findings WHERE result_id = $1")
            .bind(result.id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        self.insert_findings(result.id, &result.findings).await
    }

    async fn result(&self, id: Uuid) -> StoreResult<Option<ValidationResult>> {
        let row = sqlx::query("SELECT * FROM validation_results WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => Ok(Some(self.load_result(row).await?)),
            None => Ok(None),
        }
    }

    async fn results_for_item(&self, checklist_item_id: &str) -> StoreResult<Vec<ValidationResult>> {
        let rows = sqlx::query(
            "SELECT * FROM validation_results WHERE checklist_item_id = $1 \
             ORDER BY started_at DESC",
        )
        .bind(checklist_item_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(self.load_result(row).await?);
        }
        Ok(results)
    }

    async fn results_for_workflow(&self, workflow_id: Uuid) -> StoreResult<Vec<ValidationResult>> {
        let rows = sqlx::query(
            "SELECT * FROM validation_results WHERE workflow_id = $1 ORDER BY started_at",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(self.load_result(row).await?);
        }
        Ok(results)
    }

    async fn delete_result(&self, id: Uuid) -> StoreResult<bool> {
        let deleted = sqlx::query("DELETE FROM validation_results WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(deleted.rows_affected() > 0)
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn backend_msg(msg: String) -> StoreError {
    StoreError::Backend(msg)
}

/// Statuses a workflow may move to `to` from, per the forward-only machine.
fn allowed_froms(to: WorkflowStatus) -> Vec<String> {
    let froms: &[WorkflowStatus] = match to {
        WorkflowStatus::Pending => &[],
        WorkflowStatus::InProgress => &[WorkflowStatus::Pending],
        WorkflowStatus::Completed => &[WorkflowStatus::InProgress],
        WorkflowStatus::Failed => &[WorkflowStatus::Pending, WorkflowStatus::InProgress],
    };
    froms.iter().map(|s| s.as_str().to_string()).collect()
}

fn parse_workflow_status(s: &str) -> StoreResult<WorkflowStatus> {
    WorkflowStatus::parse(s).ok_or_else(|| backend_msg(format!("unknown workflow status {s:?}")))
}

fn parse_step_status(s: &str) -> StoreResult<StepStatus> {
    StepStatus::parse(s).ok_or_else(|| backend_msg(format!("unknown step status {s:?}")))
}

fn workflow_from_row(row: &PgRow, steps: Vec<Step>) -> StoreResult<Workflow> {
    let status: String = row.try_get("status").map_err(backend)?;
    Ok(Workflow {
        id: row.try_get("id").map_err(backend)?,
        request_id: row.try_get("request_id").map_err(backend)?,
        application_id: row.try_get("application_id").map_err(backend)?,
        status: parse_workflow_status(&status)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        completed_at: row.try_get("completed_at").map_err(backend)?,
        repository_url: row.try_get("repository_url").map_err(backend)?,
        overall_compliance: row.try_get("overall_compliance").map_err(backend)?,
        summary: row.try_get("summary").map_err(backend)?,
        steps,
    })
}

fn step_from_row(row: &PgRow) -> StoreResult<Step> {
    let status: String = row.try_get("status").map_err(backend)?;
    let kind: serde_json::Value = row.try_get("kind").map_err(backend)?;
    let kind: StepKind =
        serde_json::from_value(kind).map_err(|e| backend_msg(format!("step kind: {e}")))?;
    Ok(Step {
        id: row.try_get("id").map_err(backend)?,
        workflow_id: row.try_get("workflow_id").map_err(backend)?,
        kind,
        status: parse_step_status(&status)?,
        started_at: row.try_get("started_at").map_err(backend)?,
        completed_at: row.try_get("completed_at").map_err(backend)?,
        result_summary: row.try_get("result_summary").map_err(backend)?,
        details: row.try_get("details").map_err(backend)?,
        error_message: row.try_get("error_message").map_err(backend)?,
        integration_source: row.try_get("integration_source").map_err(backend)?,
        compliant: row.try_get("compliant").map_err(backend)?,
    })
}

fn result_from_row(row: &PgRow, findings: Vec<Finding>) -> StoreResult<ValidationResult> {
    let status: String = row.try_get("status").map_err(backend)?;
    let kind: String = row.try_get("kind").map_err(backend)?;
    let source: String = row.try_get("source").map_err(backend)?;
    Ok(ValidationResult {
        id: row.try_get("id").map_err(backend)?,
        request_id: row.try_get("request_id").map_err(backend)?,
        workflow_id: row.try_get("workflow_id").map_err(backend)?,
        checklist_item_id: row.try_get("checklist_item_id").map_err(backend)?,
        status: parse_workflow_status(&status)?,
        is_compliant: row.try_get("is_compliant").map_err(backend)?,
        kind: ValidationKind::parse(&kind)
            .ok_or_else(|| backend_msg(format!("unknown validation kind {kind:?}")))?,
        source: SourceKind::parse(&source)
            .ok_or_else(|| backend_msg(format!("unknown source kind {source:?}")))?,
        started_at: row.try_get("started_at").map_err(backend)?,
        completion_timestamp: row.try_get("completion_timestamp").map_err(backend)?,
        evidence_url: row.try_get("evidence_url").map_err(backend)?,
        summary: row.try_get("summary").map_err(backend)?,
        findings,
        raw_response: row.try_get("raw_response").map_err(backend)?,
    })
}

fn finding_from_row(row: &PgRow) -> StoreResult<Finding> {
    let severity: String = row.try_get("severity").map_err(backend)?;
    Ok(Finding {
        id: row.try_get("id").map_err(backend)?,
        description: row.try_get("description").map_err(backend)?,
        severity: Severity::parse(&severity)
            .ok_or_else(|| backend_msg(format!("unknown severity {severity:?}")))?,
        code_location: row.try_get("code_location").map_err(backend)?,
        recommendation: row.try_get("recommendation").map_err(backend)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_froms_encode_the_forward_only_machine() {
        assert!(allowed_froms(WorkflowStatus::Pending).is_empty());
        assert_eq!(allowed_froms(WorkflowStatus::InProgress), vec!["pending"]);
        assert_eq!(allowed_froms(WorkflowStatus::Completed), vec!["in_progress"]);
        assert_eq!(
            allowed_froms(WorkflowStatus::Failed),
            vec!["pending", "in_progress"]
        );
    }

    #[test]
    fn status_parsers_reject_unknown_text() {
        assert!(parse_workflow_status("in_progress").is_ok());
        assert!(parse_workflow_status("paused").is_err());
        assert!(parse_step_status("skipped").is_ok());
        assert!(parse_step_status("retrying").is_err());
    }
}
