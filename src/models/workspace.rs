//! Workflow instance identity.

use serde::{Deserialize, Serialize};

/// Key used when no repository/PR pair is known.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Environment variable naming the repository of the current workflow.
pub const REPO_ENV: &str = "DUO_REPO";

/// Environment variable naming the pull request of the current workflow.
pub const PR_ENV: &str = "DUO_PR";

/// One workflow instance: a repository and pull request number.
///
/// Every path, store namespace and message scope is derived from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Workspace {
    /// `owner/name` repository slug; empty when unknown.
    pub repo: String,
    /// Pull request number; empty when unknown.
    pub pr: String,
}

impl Workspace {
    /// Workspace for a repository and PR.
    #[must_use]
    pub fn new(repo: impl Into<String>, pr: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            pr: pr.into(),
        }
    }

    /// Whether both repository and PR are known.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        !self.repo.is_empty() && !self.pr.is_empty()
    }

    /// Filesystem-safe key, `owner-name-42` or `default`.
    #[must_use]
    pub fn key(&self) -> String {
        if self.is_scoped() {
            format!("{}-{}", self.repo.replace('/', "-"), self.pr)
        } else {
            DEFAULT_WORKSPACE.to_owned()
        }
    }

    /// Environment that lets a child's own `duo-relay` calls address this
    /// workspace. Both variables are always present, empty when unknown.
    #[must_use]
    pub fn env(&self) -> [(&'static str, &str); 2] {
        [(REPO_ENV, self.repo.as_str()), (PR_ENV, self.pr.as_str())]
    }

    /// Store namespace holding this workspace's state.
    #[must_use]
    pub fn namespace(&self) -> String {
        let pr = if self.pr.is_empty() {
            DEFAULT_WORKSPACE
        } else {
            self.pr.as_str()
        };
        format!("duo:{pr}")
    }
}
