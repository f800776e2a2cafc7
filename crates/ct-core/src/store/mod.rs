//! Result store contract
//!
//! Durable persistence for requests, workflows, steps, and per-item results.
//! Implementations must serialize updates for a single workflow and enforce
//! the forward-only status machine: terminal workflow and step statuses are
//! never overwritten.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    StepOutcome, StepStatus, ValidationRequest, ValidationResult, Workflow, WorkflowStatus,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("illegal status transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn create_request(&self, request: &ValidationRequest) -> StoreResult<()>;

    /// Persist a workflow together with its fixed step list.
    async fn create_workflow(&self, workflow: &Workflow) -> StoreResult<()>;

    /// Fresh read of a workflow and its steps.
    async fn workflow(&self, id: Uuid) -> StoreResult<Option<Workflow>>;

    /// Most recently created workflow for an application, or `None` when the
    /// application has never been validated.
    async fn latest_workflow_for_application(
        &self,
        application_id: &str,
    ) -> StoreResult<Option<Workflow>>;

    /// Compare-and-set status move; rejects anything the state machine does
    /// not allow.
    async fn transition_workflow(&self, id: Uuid, to: WorkflowStatus) -> StoreResult<()>;

    /// Move a workflow to its terminal state, recording the verdict and
    /// summary. Rejected if the workflow is already terminal.
    async fn finish_workflow(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        overall_compliance: Option<bool>,
        summary: &str,
    ) -> StoreResult<()>;

    /// Delete a workflow, cascading to its steps. Returns whether anything
    /// was deleted. Historical validation results are untouched.
    async fn delete_workflow(&self, id: Uuid) -> StoreResult<bool>;

    /// Queued -> running. Rejected for any other current status.
    async fn mark_step_running(&self, step_id: Uuid) -> StoreResult<()>;

    /// Record a step outcome. Applies only while the step is queued or
    /// running; a step already terminal is left as-is so that concurrent
    /// closers (timeouts, cancellation) cannot overwrite a real outcome.
    async fn finish_step(&self, step_id: Uuid, outcome: &StepOutcome) -> StoreResult<()>;

    /// Close every queued/running step of a workflow with the given terminal
    /// status and note. Used by cancellation (skipped) and workflow timeout
    /// (failed). Returns how many steps were closed.
    async fn close_live_steps(
        &self,
        workflow_id: Uuid,
        status: StepStatus,
        note: &str,
    ) -> StoreResult<usize>;

    async fn create_result(&self, result: &ValidationResult) -> StoreResult<()>;

    /// Replace a result record (and its findings) in place. Rejected with
    /// `IllegalTransition` when it would move a result out of a terminal
    /// status, so concurrent writers cannot revive a settled result.
    async fn update_result(&self, result: &ValidationResult) -> StoreResult<()>;

    async fn result(&self, id: Uuid) -> StoreResult<Option<ValidationResult>>;

    async fn results_for_item(
        &self,
        checklist_item_id: &str,
    ) -> StoreResult<Vec<ValidationResult>>;

    async fn results_for_workflow(&self, workflow_id: Uuid) -> StoreResult<Vec<ValidationResult>>;

    /// Delete a result, cascading to its findings. Returns whether anything
    /// was deleted.
    async fn delete_result(&self, id: Uuid) -> StoreResult<bool>;
}
