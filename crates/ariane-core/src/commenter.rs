use std::sync::Arc;

use anyhow::Result;
use tracing::error;

use crate::github::Forge;

/// Posts comments and reactions on a single repository's PRs.
pub struct Commenter {
    forge: Arc<dyn Forge>,
    owner: String,
    repo: String,
}

impl Commenter {
    pub fn new(forge: Arc<dyn Forge>, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            forge,
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    pub async fn comment_on_pull_request(&self, pr_number: u64, body: &str) -> Result<()> {
        if let Err(err) = self
            .forge
            .create_comment(&self.owner, &self.repo, pr_number, body)
            .await
        {
            error!("failed to create comment on PR #{pr_number}: {err:#}");
            return Err(err);
        }
        Ok(())
    }

    pub async fn react_to_comment(&self, comment_id: u64, emoji: &str) -> Result<()> {
        let emoji = if emoji.is_empty() { "rocket" } else { emoji };
        if let Err(err) = self
            .forge
            .create_comment_reaction(&self.owner, &self.repo, comment_id, emoji)
            .await
        {
            error!("failed to react to comment with {emoji} emoji: {err:#}");
            return Err(err);
        }
        Ok(())
    }

    pub async fn react_to_pr(&self, pr_number: u64, emoji: &str) -> Result<()> {
        let emoji = if emoji.is_empty() { "rocket" } else { emoji };
        if let Err(err) = self
            .forge
            .create_issue_reaction(&self.owner, &self.repo, pr_number, emoji)
            .await
        {
            error!("failed to react to PR with {emoji} emoji: {err:#}");
            return Err(err);
        }
        Ok(())
    }
}
