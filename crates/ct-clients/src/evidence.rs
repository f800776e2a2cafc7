//! Repository evidence fetching
//!
//! Pulls source files from a Git hosting API (GitHub-compatible) so the
//! analysis engine has real code to look at. The fetch is bounded: at most
//! `max_files` files, each at most `max_file_bytes`, filtered to source
//! extensions worth analyzing.

use async_trait::async_trait;
use ct_core::capabilities::{EvidenceFetcher, FetchError, RepoFile};
use ct_core::model::RepositoryRef;
use serde::Deserialize;

/// Configuration for the evidence fetcher
#[derive(Debug, Clone)]
pub struct EvidenceConfig {
    /// API base, e.g. `https://api.github.com`
    pub api_base: String,

    /// User agent string
    pub user_agent: String,

    /// Request timeout (seconds)
    pub timeout_secs: u64,

    /// Maximum number of files to pull per repository
    pub max_files: usize,

    /// Maximum size of a single file (bytes)
    pub max_file_bytes: u64,

    /// File extensions considered source evidence
    pub source_extensions: Vec<String>,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            user_agent: "ComplianceTracker/1.0".to_string(),
            timeout_secs: 30,
            max_files: 50,
            max_file_bytes: 256 * 1024,
            source_extensions: vec![
                "rs".to_string(),
                "py".to_string(),
                "java".to_string(),
                "kt".to_string(),
                "go".to_string(),
                "ts".to_string(),
                "js".to_string(),
                "yaml".to_string(),
                "yml".to_string(),
                "toml".to_string(),
                "sql".to_string(),
                "properties".to_string(),
            ],
        }
    }
}

/// Evidence fetcher backed by a GitHub-compatible REST API.
pub struct HttpEvidenceFetcher {
    config: EvidenceConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: Option<u64>,
}

impl HttpEvidenceFetcher {
    pub fn new(config: EvidenceConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn map_error(&self, repo: &RepositoryRef, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.config.timeout_secs)
        } else {
            FetchError::Transport(format!("{}: {err}", repo.url))
        }
    }

    fn map_status(&self, repo: &RepositoryRef, status: reqwest::StatusCode) -> FetchError {
        match status.as_u16() {
            404 => FetchError::NotFound(repo.url.clone()),
            401 | 403 => FetchError::AuthFailed(repo.url.clone()),
            _ => FetchError::Transport(format!("{}: HTTP {status}", repo.url)),
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder, repo: &RepositoryRef) -> reqwest::RequestBuilder {
        match &repo.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn list_tree(&self, repo: &RepositoryRef) -> Result<Vec<TreeEntry>, FetchError> {
        let (owner, name) = parse_repo_url(&repo.url)?;
        let revision = repo.commit_id.as_deref().unwrap_or("HEAD");
        let url = format!(
            "{}/repos/{owner}/{name}/git/trees/{revision}?recursive=1",
            self.config.api_base
        );
        let response = self
            .authorize(self.client.get(&url), repo)
            .send()
            .await
            .map_err(|e| self.map_error(repo, e))?;
        if !response.status().is_success() {
            return Err(self.map_status(repo, response.status()));
        }
        let tree: TreeResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Transport(format!("tree response: {e}")))?;
        Ok(tree.tree)
    }

    async fn fetch_file(
        &self,
        repo: &RepositoryRef,
        owner: &str,
        name: &str,
        path: &str,
    ) -> Result<String, FetchError> {
        let mut url = format!(
            "{}/repos/{owner}/{name}/contents/{path}",
            self.config.api_base
        );
        if let Some(commit) = &repo.commit_id {
            url.push_str(&format!("?ref={commit}"));
        }
        let response = self
            .authorize(self.client.get(&url), repo)
            .header("Accept", "application/vnd.github.raw+json")
            .send()
            .await
            .map_err(|e| self.map_error(repo, e))?;
        if !response.status().is_success() {
            return Err(self.map_status(repo, response.status()));
        }
        response
            .text()
            .await
            .map_err(|e| FetchError::Transport(format!("{path}: {e}")))
    }

    fn wants(&self, entry: &TreeEntry) -> bool {
        if entry.kind != "blob" {
            return false;
        }
        if entry.size.is_some_and(|s| s > self.config.max_file_bytes) {
            return false;
        }
        has_source_extension(&entry.path, &self.config.source_extensions)
    }
}

#[async_trait]
impl EvidenceFetcher for HttpEvidenceFetcher {
    async fn fetch(&self, repo: &RepositoryRef) -> Result<Vec<RepoFile>, FetchError> {
        let (owner, name) = parse_repo_url(&repo.url)?;
        let tree = self.list_tree(repo).await?;
        let total = tree.len();

        let mut files = Vec::new();
        for entry in tree.into_iter().filter(|e| self.wants(e)) {
            if files.len() >= self.config.max_files {
                tracing::debug!(
                    "Evidence cap reached for {}: keeping {} files",
                    repo.url,
                    files.len()
                );
                break;
            }
            match self.fetch_file(repo, &owner, &name, &entry.path).await {
                Ok(content) => files.push(RepoFile {
                    path: entry.path,
                    content,
                }),
                // One unreadable file does not sink the whole fetch.
                Err(err) => {
                    tracing::warn!("Skipping {} from {}: {}", entry.path, repo.url, err);
                }
            }
        }

        tracing::info!(
            "Fetched {} of {} tree entries from {}",
            files.len(),
            total,
            repo.url
        );
        Ok(files)
    }
}

/// Extract `(owner, name)` from a repository browse URL such as
/// `https://github.com/org/app` or `https://git.internal/org/app.git`.
fn parse_repo_url(url: &str) -> Result<(String, String), FetchError> {
    let trimmed = url.trim_end_matches('/');
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    let mut segments = without_scheme.split('/');
    let _host = segments.next();
    let owner = segments.next();
    let name = segments.next();
    match (owner, name) {
        (Some(owner), Some(name)) if !owner.is_empty() && !name.is_empty() => {
            let name = name.trim_end_matches(".git");
            Ok((owner.to_string(), name.to_string()))
        }
        _ => Err(FetchError::NotFound(format!(
            "cannot derive owner/name from {url}"
        ))),
    }
}

fn has_source_extension(path: &str, extensions: &[String]) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| extensions.iter().any(|e| e == ext))
        .unwrap_or(false)
}
