use crate::config::CollaboratorConfig;
use crate::pipeline::events::{EventSink, ProgressEvent};
use crate::pipeline::request::GenerateRequest;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Files and package manifest of a running sandbox.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxSnapshot {
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub manifest: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPlan {
    #[serde(default)]
    pub target_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntentResponse {
    search_plan: Option<SearchPlan>,
}

#[async_trait]
pub trait SandboxFileFetcher: Send + Sync {
    async fn fetch(&self, sandbox_id: &str) -> Result<SandboxSnapshot>;
}

#[async_trait]
pub trait IntentAnalyzer: Send + Sync {
    async fn analyze(&self, prompt: &str, manifest: &Value, model: &str) -> Result<SearchPlan>;
}

pub struct HttpSandboxFetcher {
    http: Client,
    base_url: String,
}

impl HttpSandboxFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            http: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SandboxFileFetcher for HttpSandboxFetcher {
    async fn fetch(&self, sandbox_id: &str) -> Result<SandboxSnapshot> {
        let url = format!("{}/sandboxes/{}/files", self.base_url, sandbox_id);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("sandbox fetch failed ({}): {}", status, text);
        }
        Ok(resp.json().await?)
    }
}

pub struct HttpIntentAnalyzer {
    http: Client,
    url: String,
}

impl HttpIntentAnalyzer {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            http: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl IntentAnalyzer for HttpIntentAnalyzer {
    async fn analyze(&self, prompt: &str, manifest: &Value, model: &str) -> Result<SearchPlan> {
        let body = json!({ "prompt": prompt, "manifest": manifest, "model": model });
        let resp = self.http.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("intent analysis failed ({}): {}", status, text);
        }
        let parsed: IntentResponse = resp.json().await?;
        parsed
            .search_plan
            .ok_or_else(|| anyhow::anyhow!("intent analysis returned no searchPlan"))
    }
}

/// Optional external services consulted before an edit.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub sandbox: Option<Arc<dyn SandboxFileFetcher>>,
    pub intent: Option<Arc<dyn IntentAnalyzer>>,
}

impl Collaborators {
    pub fn from_config(config: &CollaboratorConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        Self {
            sandbox: config
                .sandbox_url
                .as_deref()
                .filter(|u| !u.is_empty())
                .map(|u| Arc::new(HttpSandboxFetcher::new(u, timeout)) as Arc<dyn SandboxFileFetcher>),
            intent: config
                .intent_url
                .as_deref()
                .filter(|u| !u.is_empty())
                .map(|u| Arc::new(HttpIntentAnalyzer::new(u, timeout)) as Arc<dyn IntentAnalyzer>),
        }
    }

    /// Files to show the model for this request.
    ///
    /// Collaborator failures degrade to the broader context and are reported
    /// as `info` events. Errors only when the sink is gone.
    pub async fn resolve_files(
        &self,
        request: &GenerateRequest,
        model_id: &str,
        sink: &EventSink,
    ) -> Result<Vec<(String, String)>> {
        let mut files = request.current_files().cloned().unwrap_or_default();
        if !request.is_edit {
            return Ok(files.into_iter().collect());
        }

        let mut manifest = Value::Null;
        if files.is_empty() {
            if let (Some(fetcher), Some(sandbox_id)) = (&self.sandbox, request.sandbox_id()) {
                sink.emit(ProgressEvent::status("Loading project files")).await?;
                match fetcher.fetch(sandbox_id).await {
                    Ok(snapshot) => {
                        info!("Fetched {} files from sandbox {}", snapshot.files.len(), sandbox_id);
                        files = snapshot.files;
                        manifest = snapshot.manifest;
                    }
                    Err(e) => {
                        warn!("Sandbox fetch for {} failed: {:#}", sandbox_id, e);
                        sink.emit(ProgressEvent::info(
                            "Could not load project files, continuing without them",
                        ))
                        .await?;
                    }
                }
            }
        }
        if manifest.is_null() {
            manifest = json!({ "files": files.keys().collect::<Vec<_>>() });
        }

        if let Some(analyzer) = &self.intent {
            if !files.is_empty() {
                sink.emit(ProgressEvent::status("Analyzing edit intent")).await?;
                match analyzer.analyze(&request.prompt, &manifest, model_id).await {
                    Ok(plan) => {
                        let targeted: BTreeMap<String, String> = files
                            .iter()
                            .filter(|(path, _)| plan.target_files.iter().any(|t| t == *path))
                            .map(|(p, c)| (p.clone(), c.clone()))
                            .collect();
                        if targeted.is_empty() {
                            info!("Search plan matched no known files; using full context");
                        } else {
                            sink.emit(ProgressEvent::info(format!(
                                "Focusing on {} of {} files",
                                targeted.len(),
                                files.len()
                            )))
                            .await?;
                            files = targeted;
                        }
                    }
                    Err(e) => {
                        warn!("Intent analysis failed: {:#}", e);
                        sink.emit(ProgressEvent::info(
                            "Edit analysis unavailable, using full project context",
                        ))
                        .await?;
                    }
                }
            }
        }

        Ok(files.into_iter().collect())
    }
}
