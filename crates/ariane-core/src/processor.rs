use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::commenter::Commenter;
use crate::config::{ArianeConfig, TriggerMatch};
use crate::github::{CommitFile, Forge, PullRequest, WorkflowDispatch, WorkflowRun};

/// How far back the dependent-trigger chainer searches for a previously
/// posted phrase.
pub const COMMENT_LOOKBACK: Duration = Duration::from_secs(3 * 60 * 60);

/// Suppression window: a phrase posted this recently is not re-posted.
pub const RECENT_CUTOFF: Duration = Duration::from_secs(15 * 60);

/// Comment cap for the lookback query.
pub const COMMENT_LOOKBACK_LIMIT: u32 = 100;

/// The setup job rerun first during a failed-run rerun, when present.
const COMMIT_STATUS_START_JOB: &str = "Commit Status Start";

// ── Workflow status ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatusKind {
    Triggered,
    Skipped,
    AlreadyCompleted,
    FailedToTrigger,
    FailedToMarkSkipped,
}

impl WorkflowStatusKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Triggered => "✅ Triggered",
            Self::Skipped => "⏭️ Skipped",
            Self::AlreadyCompleted => "✔️ Already Completed",
            Self::FailedToTrigger => "❌ Failed to Trigger",
            Self::FailedToMarkSkipped => "⚠️ Failed to Mark as Skipped",
        }
    }

    fn is_failure(self) -> bool {
        matches!(self, Self::FailedToTrigger | Self::FailedToMarkSkipped)
    }
}

/// Outcome of one workflow decision, aggregated per event.
#[derive(Debug, Clone)]
pub struct WorkflowStatus {
    pub name: String,
    pub status: WorkflowStatusKind,
}

/// Render the per-event status table posted as a PR comment.
pub fn build_workflow_status_table(statuses: &[WorkflowStatus]) -> String {
    let mut table = String::from("## Workflow Status\n\n");
    table.push_str("| Workflow | Status |\n");
    table.push_str("|----------|--------|\n");
    for ws in statuses {
        let _ = writeln!(table, "| `{}` | {} |", ws.name, ws.status.label());
    }
    table
}

// ── Processor ─────────────────────────────────────────────────────────────

/// Drives the per-workflow decisions for one delivery: skip, dispatch,
/// mark-skipped or rerun, plus dependency gating and the two chainers.
pub struct WorkflowProcessor {
    pub forge: Arc<dyn Forge>,
    pub owner: String,
    pub repo: String,
    pub config: ArianeConfig,
    pub run_delay: Duration,
}

impl WorkflowProcessor {
    /// Process every workflow of a matched trigger, in declaration order.
    pub async fn process_workflows_for_trigger(
        &self,
        matched: &TriggerMatch,
        pr_number: u64,
        context_ref: &str,
        head_sha: &str,
        base_sha: &str,
        commenter: &Commenter,
    ) -> Result<()> {
        debug!("found trigger phrase: {:?}", matched.submatch);

        if !matched.depends_on.is_empty() {
            debug!("trigger depends on: {:?}", matched.depends_on);
            for dep in &matched.depends_on {
                let (can_proceed, in_progress) = self
                    .check_trigger_dependency(dep, head_sha)
                    .await
                    .map_err(|err| anyhow!("failed to check trigger dependency {dep:?}: {err}"))?;
                if !can_proceed {
                    let reason = if in_progress {
                        format!("Skipping trigger: dependency {dep:?} is still in progress")
                    } else {
                        format!(
                            "Skipping trigger: dependency {dep:?} has not completed successfully"
                        )
                    };
                    info!("{reason}");
                    bail!(reason);
                }
                debug!("dependency {dep:?} check passed");
            }
        }

        let dispatch = self.workflow_dispatch_event(
            pr_number,
            context_ref,
            head_sha,
            base_sha,
            &matched.submatch,
        );

        let files = match self.forge.pull_request_files(&self.owner, &self.repo, pr_number).await {
            Ok(files) => files,
            Err(err) => {
                if self.config.verbose() {
                    let _ = commenter
                        .comment_on_pull_request(
                            pr_number,
                            &format!("Failed to retrieve pull request files: {err}"),
                        )
                        .await;
                }
                return Err(err);
            }
        };

        let mut statuses = Vec::new();
        for workflow in &matched.workflows {
            if let Some(status) = self
                .process_workflow(workflow, &files, &dispatch, head_sha)
                .await
            {
                statuses.push(status);
            }
        }

        if self.config.verbose() && self.config.workflows_report() && !statuses.is_empty() {
            let _ = commenter
                .comment_on_pull_request(pr_number, &build_workflow_status_table(&statuses))
                .await;
        }
        Ok(())
    }

    /// Decide one workflow: skip on prior success, rerun on prior failure,
    /// otherwise dispatch or mark skipped by path policy. Failure outcomes
    /// always yield a status entry; the rest only when reporting is on.
    async fn process_workflow(
        &self,
        workflow: &str,
        files: &[CommitFile],
        dispatch: &WorkflowDispatch,
        head_sha: &str,
    ) -> Option<WorkflowStatus> {
        if self.should_skip_workflow(workflow, head_sha).await {
            return self.report(workflow, WorkflowStatusKind::AlreadyCompleted);
        }

        if self.should_run_workflow(workflow, files) {
            if let Err(err) = self
                .forge
                .dispatch_workflow(&self.owner, &self.repo, workflow, dispatch)
                .await
            {
                error!("failed to trigger workflow {workflow}: {err:#}");
                return self.report(workflow, WorkflowStatusKind::FailedToTrigger);
            }
            return self.report(workflow, WorkflowStatusKind::Triggered);
        }

        if let Err(err) = self.mark_workflow_skipped(workflow, head_sha).await {
            error!("failed to mark workflow {workflow} as skipped: {err:#}");
            return self.report(workflow, WorkflowStatusKind::FailedToMarkSkipped);
        }
        self.report(workflow, WorkflowStatusKind::Skipped)
    }

    fn report(&self, workflow: &str, status: WorkflowStatusKind) -> Option<WorkflowStatus> {
        if status.is_failure() || self.config.report_all_workflows() {
            return Some(WorkflowStatus {
                name: workflow.to_string(),
                status,
            });
        }
        None
    }

    /// True when the latest run of `workflow` at `sha` already concluded.
    /// A concluded failure also kicks off the out-of-band failed-jobs rerun.
    async fn should_skip_workflow(&self, workflow: &str, sha: &str) -> bool {
        let runs = match self
            .forge
            .workflow_runs(&self.owner, &self.repo, workflow, sha, 1)
            .await
        {
            Ok(runs) => runs,
            Err(err) => {
                warn!("failed to retrieve runs of workflow {workflow} for sha={sha}: {err:#}");
                return false;
            }
        };

        let Some(last_run) = runs.first() else {
            debug!("no prior runs of workflow {workflow} at {sha}");
            return false;
        };

        let conclusion = last_run.conclusion.as_deref().unwrap_or_default();
        debug!(
            "should skip? {}/{}:{sha} workflow {workflow}, status: {}, conclusion: {conclusion}",
            self.owner, self.repo, last_run.status
        );
        if last_run.status != "completed" {
            return false;
        }
        match conclusion {
            "success" | "skipped" => {
                debug!(
                    "skipping, workflow {workflow} ran with conclusion {conclusion} and there \
                     are no changes since the last run"
                );
                true
            }
            "failure" => {
                self.spawn_failed_jobs_rerun(workflow, last_run.id);
                true
            }
            // cancelled and friends dispatch afresh
            _ => false,
        }
    }

    fn should_run_workflow(&self, workflow: &str, files: &[CommitFile]) -> bool {
        if self.config.workflows.contains_key(workflow) {
            return self.config.should_run_workflow(workflow, files);
        }
        self.config.should_run_only_workflows(workflow, files)
    }

    /// Out-of-band rerun of a failed run: rerun the Commit Status Start
    /// job first when present, wait `run_delay`, then rerun failed jobs.
    /// Bounded by `run_delay + 5s`; errors never fail the delivery.
    fn spawn_failed_jobs_rerun(&self, workflow: &str, run_id: u64) {
        let forge = Arc::clone(&self.forge);
        let owner = self.owner.clone();
        let repo = self.repo.clone();
        let workflow = workflow.to_string();
        let run_delay = self.run_delay;

        tokio::spawn(async move {
            let task = async {
                let jobs = match forge.workflow_jobs(&owner, &repo, run_id, None, 200).await {
                    Ok(jobs) => jobs,
                    Err(err) => {
                        warn!("failed to list workflow {workflow} jobs run_id {run_id}: {err:#}");
                        return;
                    }
                };

                if let Some(job) = jobs.iter().find(|j| j.name == COMMIT_STATUS_START_JOB) {
                    debug!("re-running commit-status-start job {}", job.id);
                    if let Err(err) = forge.rerun_job(&owner, &repo, job.id).await {
                        error!("failed to re-run commit-status-start job_id {}: {err:#}", job.id);
                        return;
                    }
                    tokio::time::sleep(run_delay).await;
                }

                debug!("re-running failed workflow {workflow} run_id {run_id}");
                if let Err(err) = forge.rerun_failed_jobs(&owner, &repo, run_id).await {
                    error!("failed to re-run workflow {workflow} run_id {run_id}: {err:#}");
                }
            };
            if tokio::time::timeout(run_delay + Duration::from_secs(5), task)
                .await
                .is_err()
            {
                warn!("failed-jobs rerun for run_id {run_id} timed out");
            }
        });
    }

    /// Mark a workflow as skipped on a commit by creating a completed
    /// check run, named after the workflow's display name.
    async fn mark_workflow_skipped(&self, workflow: &str, sha: &str) -> Result<()> {
        let meta = self.forge.workflow(&self.owner, &self.repo, workflow).await?;
        self.forge
            .create_check_run(&self.owner, &self.repo, &meta.name, sha, "completed", "skipped")
            .await
    }

    /// Dispatch inputs carried to every triggered workflow. The first
    /// capture group, when present, rides along JSON-encoded as
    /// `extra-args`.
    fn workflow_dispatch_event(
        &self,
        pr_number: u64,
        context_ref: &str,
        head_sha: &str,
        base_sha: &str,
        submatch: &[String],
    ) -> WorkflowDispatch {
        let mut inputs = HashMap::from([
            ("PR-number".to_string(), pr_number.to_string()),
            ("context-ref".to_string(), context_ref.to_string()),
            ("SHA".to_string(), head_sha.to_string()),
            ("base-SHA".to_string(), base_sha.to_string()),
        ]);
        if submatch.len() > 1 {
            if let Ok(extra) = serde_json::to_string(&submatch[1]) {
                inputs.insert("extra-args".to_string(), extra);
            }
        }
        WorkflowDispatch {
            ref_name: context_ref.to_string(),
            inputs,
        }
    }

    // ── Dependency gate ───────────────────────────────────────────────────

    /// Check that every workflow of the dependency trigger concluded
    /// success or skipped at `sha`. Returns `(can_proceed, in_progress)`.
    pub async fn check_trigger_dependency(
        &self,
        depends_on_trigger: &str,
        sha: &str,
    ) -> Result<(bool, bool)> {
        let Some(dependency) = self.config.triggers.get(depends_on_trigger) else {
            bail!("dependency trigger {depends_on_trigger:?} not found in configuration");
        };

        for workflow in &dependency.workflows {
            let runs = self
                .forge
                .workflow_runs(&self.owner, &self.repo, workflow, sha, 10)
                .await
                .map_err(|err| anyhow!("failed to list workflow runs for {workflow}: {err}"))?;

            let Some(latest) = runs.first() else {
                debug!("no runs found for dependency workflow {workflow}");
                return Ok((false, false));
            };

            let conclusion = latest.conclusion.as_deref().unwrap_or_default();
            debug!(
                "dependency workflow {workflow}: status={}, conclusion={conclusion}",
                latest.status
            );
            if conclusion != "success" && conclusion != "skipped" {
                let in_progress = latest.status == "in_progress";
                return Ok((false, in_progress));
            }
        }

        Ok((true, false))
    }

    // ── Stage chainer ─────────────────────────────────────────────────────

    /// Advance a staged pipeline after a successful workflow run: when
    /// every workflow of a matched stage has succeeded at the head SHA,
    /// post the stage's command back on the PR.
    pub async fn process_stages(
        &self,
        pull_request: &PullRequest,
        workflow_path: &str,
        workflow_run: &WorkflowRun,
    ) -> Result<()> {
        let Some(stages_config) = &self.config.stages_config else {
            debug!("no stages configured");
            return Ok(());
        };
        if stages_config.label.is_empty() {
            debug!("no label for stages configured");
            return Ok(());
        }

        let pr_number = pull_request.number;
        if !pull_request.has_label(&stages_config.label) {
            debug!(
                "PR #{pr_number} does not have {} label, skipping",
                stages_config.label
            );
            return Ok(());
        }
        info!(
            "PR #{pr_number} has {} label, processing workflow run",
            stages_config.label
        );

        let workflow_file = basename(workflow_path);
        let matched: Vec<_> = stages_config
            .stages
            .iter()
            .filter(|stage| stage.workflows.iter().any(|w| w == workflow_file))
            .collect();
        if matched.is_empty() {
            debug!("workflow {workflow_file} has no configured stage");
            return Ok(());
        }

        for stage in matched {
            for workflow in &stage.workflows {
                let runs = self
                    .forge
                    .workflow_runs(&self.owner, &self.repo, workflow, &workflow_run.head_sha, 10)
                    .await?;
                if runs
                    .iter()
                    .any(|run| run.conclusion.as_deref() != Some("success"))
                    || runs.is_empty()
                {
                    debug!("workflow {workflow} has not completed successfully yet");
                    return Ok(());
                }
            }

            info!("posting command '{}' on PR #{pr_number}", stage.command);
            if let Err(err) = self
                .forge
                .create_comment(&self.owner, &self.repo, pr_number, &stage.command)
                .await
            {
                error!("failed to post command on PR #{pr_number}: {err:#}");
                continue;
            }
        }
        Ok(())
    }

    // ── Dependent-trigger chainer ─────────────────────────────────────────

    /// After a successful run, re-synthesize any dependent trigger whose
    /// dependencies are now all satisfied, by re-posting the phrase found
    /// in recent comments. A phrase posted very recently is not re-posted.
    pub async fn process_dependent_triggers(
        &self,
        pull_request: &PullRequest,
        workflow_run: &WorkflowRun,
    ) -> Result<()> {
        let pr_number = pull_request.number;
        let completed_file = basename(&workflow_run.path);

        'triggers: for (trigger_phrase, trigger) in &self.config.triggers {
            for dependency_phrase in &trigger.depends_on {
                let Some(dependency) = self.config.triggers.get(dependency_phrase) else {
                    bail!("dependency trigger {dependency_phrase} not found in trigger config");
                };

                if !dependency.workflows.iter().any(|w| w == completed_file) {
                    continue;
                }

                // this run is part of a dependency; see if the whole gate
                // now passes and the phrase should be re-posted
                let satisfied = match self
                    .check_trigger_dependency(dependency_phrase, &pull_request.head.sha)
                    .await
                {
                    Ok((satisfied, _)) => satisfied,
                    Err(err) => {
                        error!(
                            "failed to check dependencies for trigger '{trigger_phrase}': {err:#}"
                        );
                        false
                    }
                };
                if !satisfied {
                    continue;
                }

                let since = Utc::now() - COMMENT_LOOKBACK;
                let recent = Utc::now() - RECENT_CUTOFF;
                let comments = match self
                    .forge
                    .issue_comments_since(
                        &self.owner,
                        &self.repo,
                        pr_number,
                        since,
                        COMMENT_LOOKBACK_LIMIT,
                    )
                    .await
                {
                    Ok(comments) => comments,
                    Err(err) => {
                        error!("failed to retrieve comments for PR #{pr_number}: {err:#}");
                        continue;
                    }
                };

                let re = match Regex::new(trigger_phrase) {
                    Ok(re) => re,
                    Err(err) => {
                        error!(
                            "failed to compile regex for trigger phrase '{trigger_phrase}': {err}"
                        );
                        continue 'triggers;
                    }
                };

                let mut found_body = None;
                let mut found_recent = false;
                for comment in &comments {
                    if re.is_match(&comment.body) {
                        found_body = Some(comment.body.clone());
                        if comment.created_at > recent {
                            found_recent = true;
                            break;
                        }
                    }
                }

                if let Some(body) = found_body {
                    if !found_recent {
                        info!(
                            "all dependencies for trigger '{trigger_phrase}' are satisfied, \
                             posting command on PR #{pr_number}"
                        );
                        if let Err(err) = self
                            .forge
                            .create_comment(&self.owner, &self.repo, pr_number, &body)
                            .await
                        {
                            error!("failed to post command on PR #{pr_number}: {err:#}");
                        }
                        continue 'triggers;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Final path component, the workflow's file name.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
