//! LLM-backed compliance analysis
//!
//! Sends the evidence bundle to a chat-completions endpoint and parses the
//! strict-JSON verdict out of the reply. Verdicts are cached by a SHA-256
//! fingerprint of the focus area plus the exact evidence; concurrent
//! requests for the same fingerprint share one in-flight call instead of
//! hitting the endpoint twice.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ct_core::capabilities::{AnalysisEngine, AnalysisError, AnalysisReport, EvidenceBundle};
use ct_core::model::{Finding, Severity};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};

/// Configuration for the analysis engine
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Chat-completions endpoint, e.g. `https://api.openai.com/v1/chat/completions`
    pub endpoint: String,

    /// API key, sent as a bearer token
    pub api_key: String,

    /// Model identifier
    pub model: String,

    /// Request timeout (seconds)
    pub timeout_secs: u64,

    /// Truncation bound on the evidence section of the prompt (bytes)
    pub max_evidence_bytes: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 90,
            max_evidence_bytes: 96 * 1024,
        }
    }
}

type CacheCell = Arc<OnceCell<AnalysisReport>>;

/// Analysis engine that delegates the verdict to an LLM endpoint.
pub struct LlmAnalysisEngine {
    config: AnalysisConfig,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, CacheCell>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct VerdictPayload {
    is_compliant: bool,
    summary: String,
    #[serde(default)]
    confidence: Option<String>,
    #[serde(default)]
    findings: Vec<FindingPayload>,
}

#[derive(Debug, Deserialize)]
struct FindingPayload {
    description: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    code_location: Option<String>,
    #[serde(default)]
    recommendation: Option<String>,
}

impl LlmAnalysisEngine {
    pub fn new(config: AnalysisConfig) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AnalysisError::Transport(e.to_string()))?;
        Ok(Self {
            config,
            client,
            cache: Mutex::new(HashMap::new()),
        })
    }

    async fn call_endpoint(
        &self,
        focus_area: &str,
        evidence: &EvidenceBundle,
    ) -> Result<AnalysisReport, AnalysisError> {
        let prompt = build_prompt(focus_area, evidence, self.config.max_evidence_bytes);
        let body = json!({
            "model": self.config.model,
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout(self.config.timeout_secs)
                } else {
                    AnalysisError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalysisError::Unavailable(format!("HTTP {status}")));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Malformed(format!("chat envelope: {e}")))?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| AnalysisError::Malformed("no choices in reply".to_string()))?;

        parse_verdict(content)
    }
}

#[async_trait]
impl AnalysisEngine for LlmAnalysisEngine {
    async fn analyze(
        &self,
        focus_area: &str,
        evidence: &EvidenceBundle,
    ) -> Result<AnalysisReport, AnalysisError> {
        let key = fingerprint(focus_area, evidence);
        let cell = {
            let mut cache = self.cache.lock().await;
            cache.entry(key.clone()).or_default().clone()
        };

        if let Some(report) = cell.get() {
            tracing::debug!("Analysis cache hit for {focus_area} ({key})");
            return Ok(report.clone());
        }

        // OnceCell serializes initialization: only one concurrent caller per
        // fingerprint reaches the endpoint. Failed calls leave the cell empty
        // so a later request retries.
        let report = cell
            .get_or_try_init(|| self.call_endpoint(focus_area, evidence))
            .await?;
        Ok(report.clone())
    }
}

const SYSTEM_PROMPT: &str = "You are a compliance auditor. Evaluate whether the \
provided evidence satisfies the stated requirement or focus area. Respond with \
a single JSON object: {\"is_compliant\": bool, \"summary\": string, \
\"confidence\": \"low\"|\"medium\"|\"high\", \"findings\": [{\"description\": \
string, \"severity\": \"info\"|\"warning\"|\"error\"|\"critical\", \
\"code_location\": string|null, \"recommendation\": string|null}]}. No prose \
outside the JSON object.";

/// Content-addressed cache key: the focus area plus every byte of evidence
/// that influences the verdict.
fn fingerprint(focus_area: &str, evidence: &EvidenceBundle) -> String {
    let mut hasher = Sha256::new();
    hasher.update(focus_area.as_bytes());
    hasher.update([0]);
    if let Some(requirement) = &evidence.requirement {
        hasher.update(requirement.as_bytes());
    }
    hasher.update([0]);
    if let Some(context) = &evidence.context {
        hasher.update(context.as_bytes());
    }
    for snippet in &evidence.code_snippets {
        hasher.update([0]);
        hasher.update(snippet.as_bytes());
    }
    for file in &evidence.files {
        hasher.update([0]);
        hasher.update(file.path.as_bytes());
        hasher.update([0]);
        hasher.update(file.content.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn build_prompt(focus_area: &str, evidence: &EvidenceBundle, max_evidence_bytes: usize) -> String {
    let mut prompt = String::new();
    match &evidence.requirement {
        Some(requirement) => {
            prompt.push_str("Requirement:\n");
            prompt.push_str(requirement);
            prompt.push_str("\n\n");
        }
        None => {
            prompt.push_str("Focus area: ");
            prompt.push_str(focus_area);
            prompt.push_str("\n\n");
        }
    }

    let mut evidence_section = String::new();
    if let Some(context) = &evidence.context {
        evidence_section.push_str("Context:\n");
        evidence_section.push_str(context);
        evidence_section.push_str("\n\n");
    }
    for (i, snippet) in evidence.code_snippets.iter().enumerate() {
        evidence_section.push_str(&format!("Snippet {}:\n{snippet}\n\n", i + 1));
    }
    for file in &evidence.files {
        evidence_section.push_str(&format!("File {}:\n{}\n\n", file.path, file.content));
    }
    if evidence_section.len() > max_evidence_bytes {
        let mut cut = max_evidence_bytes;
        while !evidence_section.is_char_boundary(cut) {
            cut -= 1;
        }
        evidence_section.truncate(cut);
        evidence_section.push_str("\n[evidence truncated]\n");
    }

    prompt.push_str(&evidence_section);
    prompt.push_str("Evaluate compliance and respond with the JSON object only.");
    prompt
}

/// Parse the model's reply into a report, tolerating a fenced code block
/// around the JSON object.
fn parse_verdict(content: &str) -> Result<AnalysisReport, AnalysisError> {
    let cleaned = strip_fences(content);
    let payload: VerdictPayload = serde_json::from_str(cleaned)
        .map_err(|e| AnalysisError::Malformed(format!("verdict JSON: {e}")))?;
    let raw = serde_json::from_str(cleaned).unwrap_or(serde_json::Value::Null);

    let findings = payload
        .findings
        .into_iter()
        .map(|f| {
            let severity = f
                .severity
                .as_deref()
                .and_then(Severity::parse)
                .unwrap_or(Severity::Warning);
            let mut finding = Finding::new(f.description, severity);
            finding.code_location = f.code_location;
            finding.recommendation = f.recommendation;
            finding
        })
        .collect();

    Ok(AnalysisReport {
        compliant: payload.is_compliant,
        confidence: payload.confidence,
        summary: payload.summary,
        findings,
        raw,
    })
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
