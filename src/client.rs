//! OpenCode server API client.
//!
//! Thin blocking HTTP wrapper over the session endpoints the batch loop
//! needs: session creation, prompt dispatch, the live status map, and the
//! provider/agent catalogs. The rest of the app talks to the [`Backend`]
//! trait so tests can substitute a scripted fake.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Live status of a backend session, as reported by `GET /session/status`.
///
/// Sessions the backend has finished bookkeeping for are dropped from the
/// status map entirely; absence means idle.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
    Retry {
        #[serde(default)]
        attempt: u32,
        #[serde(default)]
        message: String,
        /// Epoch millis of the next retry attempt.
        #[serde(default, rename = "next")]
        next_attempt_at: u64,
    },
}

impl SessionStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionStatus::Idle)
    }
}

/// A provider/model pair, passed through to the backend verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelSelection {
    /// Parse a `provider/model` string. Model ids may themselves contain
    /// slashes, so only the first separator splits.
    pub fn parse(raw: &str) -> Option<Self> {
        let (provider, model) = raw.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self {
            provider_id: provider.to_string(),
            model_id: model.to_string(),
        })
    }
}

impl std::fmt::Display for ModelSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

/// One model in a provider's catalog. Only the fields the catalog
/// cross-check reads; everything else in the response is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// One provider in the backend catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub models: HashMap<String, ModelInfo>,
}

/// One agent in the backend catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    #[serde(default)]
    pub mode: Option<String>,
}

/// The backend operations the batch loop depends on.
///
/// `send_prompt` is the blocking HTTP call; fire-and-forget semantics are
/// the caller's concern (the sequencer dispatches it on a worker thread).
pub trait Backend: Send + Sync {
    fn create_session(&self) -> Result<String>;
    fn send_prompt(
        &self,
        session_id: &str,
        content: &str,
        model: Option<&ModelSelection>,
        agent: Option<&str>,
    ) -> Result<()>;
    fn query_status(&self) -> Result<HashMap<String, SessionStatus>>;
    fn list_providers(&self) -> Result<Vec<ProviderInfo>>;
    fn list_agents(&self) -> Result<Vec<AgentInfo>>;
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ProviderCatalog {
    #[serde(default)]
    all: Vec<ProviderInfo>,
}

/// Blocking HTTP implementation against a discovered `127.0.0.1:<port>`.
pub struct HttpBackend {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpBackend {
    pub fn new(port: u16) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build();
        Self {
            agent,
            base_url: format!("http://127.0.0.1:{port}"),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl Backend for HttpBackend {
    fn create_session(&self) -> Result<String> {
        let created: SessionCreated = self
            .agent
            .post(&self.url("/session"))
            .send_json(json!({}))
            .context("session create request failed")?
            .into_json()
            .context("session create response was not valid JSON")?;
        debug!(session_id = %created.id, "session created");
        Ok(created.id)
    }

    fn send_prompt(
        &self,
        session_id: &str,
        content: &str,
        model: Option<&ModelSelection>,
        agent: Option<&str>,
    ) -> Result<()> {
        let mut body = json!({
            "parts": [{ "type": "text", "text": content }],
        });
        if let Some(model) = model {
            body["model"] = json!({
                "providerID": model.provider_id,
                "modelID": model.model_id,
            });
        }
        if let Some(agent) = agent {
            body["agent"] = json!(agent);
        }

        self.agent
            .post(&self.url(&format!("/session/{session_id}/message")))
            .send_json(body)
            .with_context(|| format!("prompt dispatch failed for session {session_id}"))?;
        Ok(())
    }

    fn query_status(&self) -> Result<HashMap<String, SessionStatus>> {
        let status: HashMap<String, SessionStatus> = self
            .agent
            .get(&self.url("/session/status"))
            .call()
            .context("status query failed")?
            .into_json()
            .context("status response was not valid JSON")?;
        Ok(status)
    }

    fn list_providers(&self) -> Result<Vec<ProviderInfo>> {
        let catalog: ProviderCatalog = self
            .agent
            .get(&self.url("/config/providers"))
            .call()
            .context("provider catalog request failed")?
            .into_json()
            .context("provider catalog response was not valid JSON")?;
        Ok(catalog.all)
    }

    fn list_agents(&self) -> Result<Vec<AgentInfo>> {
        let agents: Vec<AgentInfo> = self
            .agent
            .get(&self.url("/agent"))
            .call()
            .context("agent catalog request failed")?
            .into_json()
            .context("agent catalog response was not valid JSON")?;
        Ok(agents)
    }
}
