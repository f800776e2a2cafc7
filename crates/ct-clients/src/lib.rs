//! HTTP collaborators for the validation engine
//!
//! Production implementations of the engine's capability traits: evidence
//! fetching from a Git hosting API, compliance analysis through a
//! chat-completions LLM endpoint, and external integration checks. Each
//! client owns its configuration and a shared `reqwest::Client`.

pub mod analysis;
pub mod evidence;
pub mod integrations;

pub use analysis::{AnalysisConfig, LlmAnalysisEngine};
pub use evidence::{EvidenceConfig, HttpEvidenceFetcher};
pub use integrations::{HttpIntegrationClient, IntegrationClientConfig};
