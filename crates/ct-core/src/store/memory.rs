//! In-memory result store
//!
//! Backs tests and database-less runs. A single mutex over the whole state
//! gives the per-workflow update serialization the contract requires.

use super::{ResultStore, StoreError, StoreResult};
use crate::model::{
    StepOutcome, StepStatus, ValidationRequest, ValidationResult, Workflow, WorkflowStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    requests: HashMap<Uuid, ValidationRequest>,
    workflows: HashMap<Uuid, Workflow>,
    /// step id -> owning workflow id
    step_index: HashMap<Uuid, Uuid>,
    results: HashMap<Uuid, ValidationResult>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn create_request(&self, request: &ValidationRequest) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn create_workflow(&self, workflow: &Workflow) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        for step in &workflow.steps {
            inner.step_index.insert(step.id, workflow.id);
        }
        inner.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>> {
        let inner = self.inner.lock().await;
        Ok(inner.workflows.get(&id).cloned())
    }

    async fn latest_workflow_for_application(
        &self,
        application_id: &str,
    ) -> StoreResult<Option<Workflow>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .workflows
            .values()
            .filter(|w| w.application_id.as_deref() == Some(application_id))
            .max_by_key(|w| w.created_at)
            .cloned())
    }

    async fn transition_workflow(&self, id: Uuid, to: WorkflowStatus) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let workflow = inner.workflows.get_mut(&id).ok_or(StoreError::NotFound)?;
        if !workflow.status.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                from: workflow.status.to_string(),
                to: to.to_string(),
            });
        }
        workflow.status = to;
        Ok(())
    }

    async fn finish_workflow(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        overall_compliance: Option<bool>,
        summary: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let workflow = inner.workflows.get_mut(&id).ok_or(StoreError::NotFound)?;
        if !workflow.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                from: workflow.status.to_string(),
                to: status.to_string(),
            });
        }
        workflow.status = status;
        workflow.completed_at = Some(Utc::now());
        workflow.overall_compliance =
            if status == WorkflowStatus::Completed { overall_compliance } else { None };
        workflow.summary = Some(summary.to_string());
        Ok(())
    }

    async fn delete_workflow(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.workflows.remove(&id) {
            Some(workflow) => {
                for step in &workflow.steps {
                    inner.step_index.remove(&step.id);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_step_running(&self, step_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let workflow_id = *inner.step_index.get(&step_id).ok_or(StoreError::NotFound)?;
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::NotFound)?;
        let step = workflow
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or(StoreError::NotFound)?;
        if step.status != StepStatus::Queued {
            return Err(StoreError::IllegalTransition {
                from: step.status.to_string(),
                to: StepStatus::Running.to_string(),
            });
        }
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        Ok(())
    }

    async fn finish_step(&self, step_id: Uuid, outcome: &StepOutcome) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let workflow_id = *inner.step_index.get(&step_id).ok_or(StoreError::NotFound)?;
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::NotFound)?;
        let step = workflow
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or(StoreError::NotFound)?;
        if step.status.is_terminal() {
            // A concurrent closer already settled this step.
            return Ok(());
        }
        step.status = outcome.status;
        step.completed_at = Some(Utc::now());
        step.result_summary = Some(outcome.summary.clone());
        step.details = Some(outcome.details.clone());
        step.error_message = outcome.error.clone();
        step.compliant = outcome.compliant;
        Ok(())
    }

    async fn close_live_steps(
        &self,
        workflow_id: Uuid,
        status: StepStatus,
        note: &str,
    ) -> StoreResult<usize> {
        let mut inner = self.inner.lock().await;
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::NotFound)?;
        let mut closed = 0;
        for step in workflow
            .steps
            .iter_mut()
            .filter(|s| !s.status.is_terminal())
        {
            step.status = status;
            step.completed_at = Some(Utc::now());
            match status {
                StepStatus::Failed => step.error_message = Some(note.to_string()),
                _ => step.result_summary = Some(note.to_string()),
            }
            closed += 1;
        }
        Ok(closed)
    }

    async fn create_result(&self, result: &ValidationResult) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.results.insert(result.id, result.clone());
        Ok(())
    }

    async fn update_result(&self, result: &ValidationResult) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let current = inner.results.get(&result.id).ok_or(StoreError::NotFound)?;
        // A stale writer must not drag a settled result back to a live status.
        if current.status.is_terminal() && current.status != result.status {
            return Err(StoreError::IllegalTransition {
                from: current.status.to_string(),
                to: result.status.to_string(),
            });
        }
        inner.results.insert(result.id, result.clone());
        Ok(())
    }

    async fn result(&self, id: Uuid) -> StoreResult<Option<ValidationResult>> {
        let inner = self.inner.lock().await;
        Ok(inner.results.get(&id).cloned())
    }

    async fn results_for_item(
        &self,
        checklist_item_id: &str,
    ) -> StoreResult<Vec<ValidationResult>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .results
            .values()
            .filter(|r| r.checklist_item_id == checklist_item_id)
            .cloned()
            .collect())
    }

    async fn results_for_workflow(&self, workflow_id: Uuid) -> StoreResult<Vec<ValidationResult>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .results
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn delete_result(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.results.remove(&id).is_some())
    }
}
