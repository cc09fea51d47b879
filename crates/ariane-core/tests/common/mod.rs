#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use ariane_core::github::{
    CommitFile, Forge, IssueComment, PullRequest, TeamMembership, Workflow, WorkflowDispatch,
    WorkflowJob, WorkflowRun,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Scripted in-memory forge: canned lookups, recorded writes.
#[derive(Default)]
pub struct MockForge {
    pub pull_requests: Mutex<HashMap<u64, PullRequest>>,
    pub files: Mutex<Vec<CommitFile>>,
    /// Keyed by file path; the ref is ignored.
    pub contents: Mutex<HashMap<String, String>>,
    /// Keyed by (workflow file, head sha), most recent run first.
    pub runs: Mutex<HashMap<(String, String), Vec<WorkflowRun>>>,
    pub runs_by_id: Mutex<HashMap<u64, WorkflowRun>>,
    pub jobs: Mutex<HashMap<u64, Vec<WorkflowJob>>>,
    pub workflows: Mutex<HashMap<String, Workflow>>,
    pub comments: Mutex<Vec<IssueComment>>,
    /// Keyed by (team, user).
    pub memberships: Mutex<HashMap<(String, String), TeamMembership>>,
    /// When set, team membership lookups fail with this message.
    pub membership_error: Mutex<Option<String>>,
    /// When true, workflow dispatch requests fail.
    pub fail_dispatch: Mutex<bool>,

    pub dispatched: Mutex<Vec<(String, WorkflowDispatch)>>,
    /// (name, head_sha, status, conclusion)
    pub check_runs: Mutex<Vec<(String, String, String, String)>>,
    pub posted_comments: Mutex<Vec<(u64, String)>>,
    pub comment_reactions: Mutex<Vec<(u64, String)>>,
    pub issue_reactions: Mutex<Vec<(u64, String)>>,
    pub failed_job_reruns: Mutex<Vec<u64>>,
    pub job_reruns: Mutex<Vec<u64>>,
}

impl MockForge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(self, doc: &str) -> Self {
        self.contents
            .lock()
            .unwrap()
            .insert(".github/ariane-config.yaml".to_string(), doc.to_string());
        self
    }

    pub fn with_pull_request(self, pr: PullRequest) -> Self {
        self.pull_requests.lock().unwrap().insert(pr.number, pr);
        self
    }

    pub fn with_files(self, names: &[&str]) -> Self {
        *self.files.lock().unwrap() = names
            .iter()
            .map(|n| CommitFile {
                filename: n.to_string(),
            })
            .collect();
        self
    }

    pub fn with_run(self, workflow: &str, sha: &str, run: WorkflowRun) -> Self {
        self.runs
            .lock()
            .unwrap()
            .entry((workflow.to_string(), sha.to_string()))
            .or_default()
            .push(run);
        self
    }

    pub fn with_run_by_id(self, run: WorkflowRun) -> Self {
        self.runs_by_id.lock().unwrap().insert(run.id, run);
        self
    }

    pub fn with_jobs(self, run_id: u64, jobs: Vec<WorkflowJob>) -> Self {
        self.jobs.lock().unwrap().insert(run_id, jobs);
        self
    }

    pub fn with_comment(self, body: &str, age: Duration) -> Self {
        let id = self.comments.lock().unwrap().len() as u64 + 1;
        self.comments.lock().unwrap().push(IssueComment {
            id,
            body: body.to_string(),
            user: Default::default(),
            created_at: Utc::now() - age,
        });
        self
    }

    pub fn with_membership(self, team: &str, user: &str, state: &str) -> Self {
        self.memberships.lock().unwrap().insert(
            (team.to_string(), user.to_string()),
            TeamMembership {
                state: state.to_string(),
            },
        );
        self
    }

    pub fn dispatched_workflows(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|(w, _)| w.clone())
            .collect()
    }

    pub fn posted_bodies(&self) -> Vec<String> {
        self.posted_comments
            .lock()
            .unwrap()
            .iter()
            .map(|(_, b)| b.clone())
            .collect()
    }
}

#[async_trait]
impl Forge for MockForge {
    async fn pull_request(&self, _owner: &str, _repo: &str, number: u64) -> Result<PullRequest> {
        match self.pull_requests.lock().unwrap().get(&number) {
            Some(pr) => Ok(pr.clone()),
            None => bail!("pull request #{number} not found"),
        }
    }

    async fn pull_request_files(
        &self,
        _owner: &str,
        _repo: &str,
        _number: u64,
    ) -> Result<Vec<CommitFile>> {
        Ok(self.files.lock().unwrap().clone())
    }

    async fn file_contents(
        &self,
        _owner: &str,
        _repo: &str,
        path: &str,
        _git_ref: &str,
    ) -> Result<String> {
        match self.contents.lock().unwrap().get(path) {
            Some(doc) => Ok(doc.clone()),
            None => bail!("no contents for {path}"),
        }
    }

    async fn team_membership(
        &self,
        _org: &str,
        team: &str,
        user: &str,
    ) -> Result<Option<TeamMembership>> {
        if let Some(message) = self.membership_error.lock().unwrap().clone() {
            bail!(message);
        }
        Ok(self
            .memberships
            .lock()
            .unwrap()
            .get(&(team.to_string(), user.to_string()))
            .cloned())
    }

    async fn workflow_runs(
        &self,
        _owner: &str,
        _repo: &str,
        workflow: &str,
        head_sha: &str,
        per_page: u32,
    ) -> Result<Vec<WorkflowRun>> {
        let runs = self
            .runs
            .lock()
            .unwrap()
            .get(&(workflow.to_string(), head_sha.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok(runs.into_iter().take(per_page as usize).collect())
    }

    async fn workflow_run(&self, _owner: &str, _repo: &str, run_id: u64) -> Result<WorkflowRun> {
        match self.runs_by_id.lock().unwrap().get(&run_id) {
            Some(run) => Ok(run.clone()),
            None => bail!("workflow run {run_id} not found"),
        }
    }

    async fn workflow_jobs(
        &self,
        _owner: &str,
        _repo: &str,
        run_id: u64,
        _filter: Option<&str>,
        _per_page: u32,
    ) -> Result<Vec<WorkflowJob>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn workflow(&self, _owner: &str, _repo: &str, workflow: &str) -> Result<Workflow> {
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .get(workflow)
            .cloned()
            .unwrap_or_else(|| Workflow {
                id: 1,
                name: workflow.to_string(),
                path: format!(".github/workflows/{workflow}"),
            }))
    }

    async fn issue_comments_since(
        &self,
        _owner: &str,
        _repo: &str,
        _number: u64,
        since: DateTime<Utc>,
        per_page: u32,
    ) -> Result<Vec<IssueComment>> {
        Ok(self
            .comments
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.created_at >= since)
            .take(per_page as usize)
            .cloned()
            .collect())
    }

    async fn dispatch_workflow(
        &self,
        _owner: &str,
        _repo: &str,
        workflow: &str,
        event: &WorkflowDispatch,
    ) -> Result<()> {
        if *self.fail_dispatch.lock().unwrap() {
            bail!("dispatch refused");
        }
        self.dispatched
            .lock()
            .unwrap()
            .push((workflow.to_string(), event.clone()));
        Ok(())
    }

    async fn create_check_run(
        &self,
        _owner: &str,
        _repo: &str,
        name: &str,
        head_sha: &str,
        status: &str,
        conclusion: &str,
    ) -> Result<()> {
        self.check_runs.lock().unwrap().push((
            name.to_string(),
            head_sha.to_string(),
            status.to_string(),
            conclusion.to_string(),
        ));
        Ok(())
    }

    async fn create_comment(
        &self,
        _owner: &str,
        _repo: &str,
        number: u64,
        body: &str,
    ) -> Result<()> {
        self.posted_comments
            .lock()
            .unwrap()
            .push((number, body.to_string()));
        Ok(())
    }

    async fn create_comment_reaction(
        &self,
        _owner: &str,
        _repo: &str,
        comment_id: u64,
        reaction: &str,
    ) -> Result<()> {
        self.comment_reactions
            .lock()
            .unwrap()
            .push((comment_id, reaction.to_string()));
        Ok(())
    }

    async fn create_issue_reaction(
        &self,
        _owner: &str,
        _repo: &str,
        number: u64,
        reaction: &str,
    ) -> Result<()> {
        self.issue_reactions
            .lock()
            .unwrap()
            .push((number, reaction.to_string()));
        Ok(())
    }

    async fn rerun_failed_jobs(&self, _owner: &str, _repo: &str, run_id: u64) -> Result<()> {
        self.failed_job_reruns.lock().unwrap().push(run_id);
        Ok(())
    }

    async fn rerun_job(&self, _owner: &str, _repo: &str, job_id: u64) -> Result<()> {
        self.job_reruns.lock().unwrap().push(job_id);
        Ok(())
    }
}

// ── Fixture builders ──────────────────────────────────────────────────────

pub fn open_pr(number: u64, creator: &str) -> PullRequest {
    use ariane_core::github::{BranchRef, Repository, User};
    PullRequest {
        number,
        state: "open".into(),
        user: User {
            login: creator.into(),
        },
        head: BranchRef {
            ref_name: "feature".into(),
            sha: "headsha".into(),
            repo: Some(Repository {
                name: "repo".into(),
                owner: User {
                    login: "owner".into(),
                },
            }),
        },
        base: BranchRef {
            ref_name: "main".into(),
            sha: "basesha".into(),
            repo: None,
        },
        labels: vec![],
    }
}

pub fn fork_pr(number: u64, creator: &str) -> PullRequest {
    use ariane_core::github::{Repository, User};
    let mut pr = open_pr(number, creator);
    pr.head.repo = Some(Repository {
        name: "repo".into(),
        owner: User {
            login: "someone-else".into(),
        },
    });
    pr
}

pub fn completed_run(id: u64, sha: &str, conclusion: &str) -> WorkflowRun {
    WorkflowRun {
        id,
        status: "completed".into(),
        conclusion: Some(conclusion.into()),
        head_sha: sha.into(),
        path: String::new(),
        run_attempt: 1,
        pull_requests: vec![],
    }
}

pub fn in_progress_run(id: u64, sha: &str) -> WorkflowRun {
    WorkflowRun {
        id,
        status: "in_progress".into(),
        conclusion: None,
        head_sha: sha.into(),
        path: String::new(),
        run_attempt: 1,
        pull_requests: vec![],
    }
}

pub fn job(id: u64, name: &str, conclusion: Option<&str>) -> WorkflowJob {
    WorkflowJob {
        id,
        name: name.into(),
        conclusion: conclusion.map(String::from),
    }
}
