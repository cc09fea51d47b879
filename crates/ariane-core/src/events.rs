use anyhow::{Context, Result};
use serde::Deserialize;

use crate::github::{IssueComment, PullRequest, Repository, Workflow, WorkflowRun};

// ── Webhook envelopes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Installation {
    pub id: u64,
}

/// The issue half of an issue_comment payload. The `pull_request` key is
/// present exactly when the issue is a PR.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Issue {
    pub number: u64,
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

impl Issue {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueCommentEvent {
    pub action: String,
    pub issue: Issue,
    pub comment: IssueComment,
    pub repository: Repository,
    #[serde(default)]
    pub installation: Installation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub pull_request: PullRequest,
    pub repository: Repository,
    #[serde(default)]
    pub installation: Installation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunEvent {
    pub action: String,
    #[serde(default)]
    pub workflow: Workflow,
    pub workflow_run: WorkflowRun,
    pub repository: Repository,
    #[serde(default)]
    pub installation: Installation,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MergeGroup {
    pub head_sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeGroupEvent {
    pub action: String,
    pub merge_group: MergeGroup,
    pub repository: Repository,
    #[serde(default)]
    pub installation: Installation,
}

// ── Decoded event ─────────────────────────────────────────────────────────

/// A decoded webhook delivery, one variant per handled event kind.
#[derive(Debug, Clone)]
pub enum Event {
    IssueComment(IssueCommentEvent),
    PullRequest(PullRequestEvent),
    WorkflowRun(WorkflowRunEvent),
    MergeGroup(MergeGroupEvent),
}

impl Event {
    /// Decode a delivery by its event-type header. Returns `None` for
    /// kinds this service does not handle.
    pub fn decode(event_type: &str, payload: &[u8]) -> Result<Option<Event>> {
        let event = match event_type {
            "issue_comment" => Event::IssueComment(
                serde_json::from_slice(payload)
                    .context("failed to parse issue_comment event payload")?,
            ),
            "pull_request" => Event::PullRequest(
                serde_json::from_slice(payload)
                    .context("failed to parse pull_request event payload")?,
            ),
            "workflow_run" => Event::WorkflowRun(
                serde_json::from_slice(payload)
                    .context("failed to parse workflow_run event payload")?,
            ),
            "merge_group" => Event::MergeGroup(
                serde_json::from_slice(payload)
                    .context("failed to parse merge_group event payload")?,
            ),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn installation_id(&self) -> u64 {
        match self {
            Event::IssueComment(e) => e.installation.id,
            Event::PullRequest(e) => e.installation.id,
            Event::WorkflowRun(e) => e.installation.id,
            Event::MergeGroup(e) => e.installation.id,
        }
    }
}
