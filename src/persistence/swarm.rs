//! Workflow metadata and per-agent attributes of one workspace.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::models::Workspace;
use crate::Result;

use super::state_repo::StateRepo;

/// Per-agent attribute names, stored as `{agent}:{field}`.
pub const AGENT_FIELDS: [&str; 6] = ["session", "fifo", "pid", "log", "model", "cwd"];

/// View of the state namespace belonging to one workspace.
#[derive(Clone)]
pub struct SwarmState {
    repo: StateRepo,
    workspace: Workspace,
    namespace: String,
}

impl SwarmState {
    /// Bind `repo` to the namespace of `workspace`.
    #[must_use]
    pub fn new(repo: StateRepo, workspace: &Workspace) -> Self {
        Self {
            repo,
            namespace: workspace.namespace(),
            workspace: workspace.clone(),
        }
    }

    /// Namespace all keys live in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Record the workflow metadata and reset the stage to `1`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a write fails.
    pub async fn init(&self, branch: &str, base: &str, runner: &str) -> Result<()> {
        let started_at = Utc::now().timestamp().to_string();
        for (key, value) in [
            ("repo", self.workspace.repo.as_str()),
            ("pr", self.workspace.pr.as_str()),
            ("branch", branch),
            ("base", base),
            ("runner", runner),
            ("stage", "1"),
            ("started_at", started_at.as_str()),
        ] {
            self.set(key, value).await?;
        }
        Ok(())
    }

    /// Set a bare field.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the write fails.
    pub async fn set(&self, field: &str, value: &str) -> Result<()> {
        self.repo.set(&self.namespace, field, value).await
    }

    /// Read a bare field.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the read fails.
    pub async fn get(&self, field: &str) -> Result<Option<String>> {
        self.repo.get(&self.namespace, field).await
    }

    /// Snapshot the whole namespace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the read fails.
    pub async fn get_all(&self) -> Result<BTreeMap<String, String>> {
        self.repo.get_all(&self.namespace).await
    }

    /// Set several attributes of `agent`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a write fails.
    pub async fn set_agent(&self, agent: &str, fields: &[(&str, &str)]) -> Result<()> {
        for (field, value) in fields {
            self.set(&agent_key(agent, field), value).await?;
        }
        Ok(())
    }

    /// Read every known attribute of `agent`; missing ones map to `None`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the read fails.
    pub async fn get_agent(&self, agent: &str) -> Result<BTreeMap<String, Option<String>>> {
        let all = self.get_all().await?;
        Ok(AGENT_FIELDS
            .iter()
            .map(|field| {
                let value = all.get(&agent_key(agent, field)).cloned();
                ((*field).to_owned(), value)
            })
            .collect())
    }

    /// Names of agents that have a recorded session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the read fails.
    pub async fn agents(&self) -> Result<Vec<String>> {
        let all = self.get_all().await?;
        Ok(all
            .keys()
            .filter_map(|key| key.strip_suffix(":session"))
            .map(str::to_owned)
            .collect())
    }

    /// Forget every attribute of `agent`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a delete fails.
    pub async fn remove_agent(&self, agent: &str) -> Result<()> {
        for field in AGENT_FIELDS {
            self.repo.delete(&self.namespace, &agent_key(agent, field)).await?;
        }
        Ok(())
    }

    /// Delete the whole namespace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the delete fails.
    pub async fn delete(&self) -> Result<u64> {
        self.repo.delete_namespace(&self.namespace).await
    }
}

fn agent_key(agent: &str, field: &str) -> String {
    format!("{agent}:{field}")
}
