//! Documentation provider adapters
//!
//! The provider performs the actual lookup on a cache miss. It is stateless
//! and must be safe to retry.

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Content returned by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDocument {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<serde_json::Value>,
}

impl ProviderDocument {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            citations: None,
        }
    }

    pub fn with_citations(mut self, citations: serde_json::Value) -> Self {
        self.citations = Some(citations);
        self
    }
}

#[async_trait]
pub trait DocumentationProvider: Send + Sync {
    /// Fetch documentation for `library_id` at `version` answering `intent_query`
    async fn fetch(
        &self,
        library_id: &str,
        version: &str,
        intent_query: &str,
    ) -> Result<ProviderDocument>;
}

/// Provider backed by an external command
///
/// Runs `<program> <args..> <library> <version> <query>`. Stdout is taken as
/// the document; if it parses as a JSON object with a `content` field the
/// `citations` field is kept too.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandProvider {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn parse_output(stdout: &str) -> Option<ProviderDocument> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('{') {
            if let Ok(doc) = serde_json::from_str::<ProviderDocument>(trimmed) {
                return Some(doc);
            }
        }
        Some(ProviderDocument::new(trimmed))
    }
}

#[async_trait]
impl DocumentationProvider for CommandProvider {
    async fn fetch(
        &self,
        library_id: &str,
        version: &str,
        intent_query: &str,
    ) -> Result<ProviderDocument> {
        let mut cmd = Command::new(&self.program);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.args(&self.args)
            .arg(library_id)
            .arg(version)
            .arg(intent_query);

        // Close stdin so the child never waits on it
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!("Running provider command: {:?}", cmd);

        let output = cmd.output().await.map_err(|e| {
            CacheError::ProviderFailure(format!(
                "failed to execute {}: {}",
                self.program.display(),
                e
            ))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(CacheError::ProviderFailure(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        if !stderr.is_empty() {
            tracing::warn!("provider stderr: {}", stderr.trim());
        }

        Self::parse_output(&stdout).ok_or_else(|| {
            CacheError::ProviderFailure(format!(
                "no documentation for {}@{} ({})",
                library_id, version, intent_query
            ))
        })
    }
}
