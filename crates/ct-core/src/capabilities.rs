//! Collaborator capability contracts
//!
//! The orchestrator consumes these as opaque capabilities: something that can
//! fetch repository evidence, something that can analyze evidence for a focus
//! area, and something that can run an external integration check.
//! Credentials are request-scoped and travel with each call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Finding, IntegrationConfig, RepositoryRef};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("repository not found: {0}")]
    NotFound(String),

    #[error("repository authentication failed: {0}")]
    AuthFailed(String),

    #[error("repository fetch timed out after {0}s")]
    Timeout(u64),

    #[error("repository transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("analysis engine unavailable: {0}")]
    Unavailable(String),

    #[error("analysis response malformed: {0}")]
    Malformed(String),

    #[error("analysis timed out after {0}s")]
    Timeout(u64),

    #[error("analysis transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum IntegrationError {
    #[error("integration not configured: {0}")]
    NotConfigured(String),

    #[error("integration authentication failed: {0}")]
    AuthFailed(String),

    #[error("integration check timed out after {0}s")]
    Timeout(u64),

    #[error("integration transport error: {0}")]
    Transport(String),
}

/// One file's contents fetched from a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoFile {
    pub path: String,
    pub content: String,
}

/// Everything handed to the analysis engine for one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceBundle {
    /// Requirement text being validated, when known.
    pub requirement: Option<String>,
    /// Free-text evidence supplied with the request.
    pub context: Option<String>,
    pub code_snippets: Vec<String>,
    pub files: Vec<RepoFile>,
}

impl EvidenceBundle {
    /// Whether there is anything at all for the engine to look at beyond the
    /// requirement text.
    pub fn has_material(&self) -> bool {
        self.context.is_some() || !self.code_snippets.is_empty() || !self.files.is_empty()
    }
}

/// Compliance verdict produced by the analysis engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub compliant: bool,
    pub confidence: Option<String>,
    pub summary: String,
    pub findings: Vec<Finding>,
    /// The raw engine payload, kept for audit.
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Success,
    Failure,
    Error,
}

/// Raw result of one external integration check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub message: String,
    pub detail: serde_json::Value,
}

/// One integration check to run: the identifier plus its configuration.
#[derive(Debug, Clone)]
pub struct IntegrationCheck {
    pub integration_id: String,
    pub config: IntegrationConfig,
}

/// Retrieves file contents for a repository reference. Stateless per call.
#[async_trait]
pub trait EvidenceFetcher: Send + Sync {
    async fn fetch(&self, repo: &RepositoryRef) -> Result<Vec<RepoFile>, FetchError>;
}

/// Produces a compliance verdict for a focus area given evidence.
///
/// Implementations that cache by content fingerprint must guarantee at most
/// one concurrent computation per fingerprint; concurrent callers await the
/// in-flight computation.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn analyze(
        &self,
        focus_area: &str,
        evidence: &EvidenceBundle,
    ) -> Result<AnalysisReport, AnalysisError>;
}

/// Runs one configured external check and reports pass/fail/error.
#[async_trait]
pub trait IntegrationClient: Send + Sync {
    async fn run(&self, check: &IntegrationCheck) -> Result<CheckOutcome, IntegrationError>;
}
