//! Compliance Validation Workflow Engine
//!
//! This crate provides the core engine for tracking compliance validations:
//! the workflow orchestrator, the step executor, the result-store contract,
//! and the collaborator capabilities (evidence fetching, analysis, external
//! integration checks) the engine invokes.

pub mod capabilities;
pub mod executor;
pub mod model;
pub mod orchestrator;
pub mod store;

use thiserror::Error;

pub use capabilities::{
    AnalysisEngine, AnalysisReport, CheckOutcome, CheckStatus, EvidenceBundle, EvidenceFetcher,
    IntegrationCheck, IntegrationClient, RepoFile,
};
pub use executor::{StepContext, StepExecutor};
pub use model::{
    Finding, IntegrationConfig, RepositoryRef, Severity, SourceKind, Step, StepKind, StepOutcome,
    StepStatus, TargetScope, ValidationKind, ValidationRequest, ValidationResult, Workflow,
    WorkflowStatus,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, Submission};
pub use store::{MemoryStore, ResultStore, StoreError};

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<store::StoreError> for CoreError {
    fn from(err: store::StoreError) -> Self {
        match err {
            store::StoreError::NotFound => CoreError::NotFound("record not found".to_string()),
            other => CoreError::Store(other.to_string()),
        }
    }
}
