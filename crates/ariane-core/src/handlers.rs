use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tracing::{debug, error, info, warn};

use crate::commenter::Commenter;
use crate::config::{fetch_repo_config, ArianeConfig};
use crate::events::{IssueCommentEvent, MergeGroupEvent, PullRequestEvent, WorkflowRunEvent};
use crate::github::{Forge, PullRequest};
use crate::processor::WorkflowProcessor;

/// Synthetic trigger phrase matched on PR lifecycle events.
const DEFAULT_RUN_TRIGGER: &str = "/default";

/// PR actions that start the default trigger.
const ALLOWED_PR_ACTIONS: &[&str] = &["opened", "reopened", "synchronize"];

/// Check name satisfied on merge-group entry.
const ANY_SOURCE_CHECK: &str = "any-source";

// ── Shared helpers ────────────────────────────────────────────────────────

/// Fetch PR metadata, retrying transient errors with exponential backoff
/// (0s, 1s, 2s, …). The PR must be open.
pub async fn get_pull_request(
    forge: &dyn Forge,
    owner: &str,
    repo: &str,
    pr_number: u64,
    max_retry_attempts: u32,
) -> Result<PullRequest> {
    let mut attempt = 0u32;
    let pr = loop {
        match forge.pull_request(owner, repo, pr_number).await {
            Ok(pr) => break pr,
            Err(err) if attempt < max_retry_attempts => {
                let backoff = if attempt == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_secs(1 << (attempt - 1))
                };
                warn!(
                    "failed to retrieve pull request on attempt {attempt}, retrying in \
                     {backoff:?}: {err:#}"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => {
                error!("failed to retrieve pull request after {attempt} attempts: {err:#}");
                return Err(err);
            }
        }
    };

    if pr.state != "open" {
        bail!("pull request is not open");
    }
    Ok(pr)
}

/// Pick the ref workflows resolve at: the head branch for same-repo PRs,
/// the base branch for forks. Returns `(context_ref, head_sha, base_sha)`.
pub fn determine_context_ref(pr: &PullRequest, owner: &str, repo: &str) -> (String, String, String) {
    let head_sha = pr.head.sha.clone();
    let base_sha = pr.base.sha.clone();
    let from_fork = pr
        .head
        .repo
        .as_ref()
        .map(|r| r.owner.login != owner || r.name != repo)
        .unwrap_or(true);

    let context_ref = if from_fork {
        debug!(
            "PR is from a fork, workflows for {head_sha} will run in the context of the target \
             branch {}",
            pr.base.ref_name
        );
        pr.base.ref_name.clone()
    } else {
        debug!(
            "PR is not from a fork, workflows for {head_sha} will run in the context of the PR \
             branch {}",
            pr.head.ref_name
        );
        pr.head.ref_name.clone()
    };
    (context_ref, head_sha, base_sha)
}

/// Allowlist check against team membership. An empty allowlist allows
/// everyone; 404 means "not a member, try the next team"; any other forge
/// error fails closed.
pub async fn is_allowed_team_member(
    forge: &dyn Forge,
    config: &ArianeConfig,
    owner: &str,
    author: &str,
) -> bool {
    if config.allowed_teams.is_empty() {
        return true;
    }
    for team in &config.allowed_teams {
        match forge.team_membership(owner, team, author).await {
            Ok(Some(membership)) if membership.state == "active" => return true,
            Ok(_) => {
                debug!("user {author} is not an (active) member of the team {team}");
            }
            Err(err) => {
                error!("failed to retrieve author's membership in allowlisted teams: {err:#}");
                return false;
            }
        }
    }
    false
}

/// Bot-name convention: owned bots are `<owner>…[bot]`.
fn is_owned_bot(login: &str, owner: &str) -> bool {
    login.starts_with(owner) && login.ends_with("[bot]")
}

// ── issue_comment ─────────────────────────────────────────────────────────

pub async fn handle_issue_comment(
    forge: Arc<dyn Forge>,
    event: &IssueCommentEvent,
    run_delay: Duration,
    max_retry_attempts: u32,
) -> Result<()> {
    if !event.issue.is_pull_request() {
        debug!("issue comment event is not for a pull request");
        return Ok(());
    }
    debug!("event action is {}", event.action);
    if event.action != "created" {
        return Ok(());
    }

    let owner = event.repository.owner.login.clone();
    let repo = event.repository.name.clone();
    let pr_number = event.issue.number;
    let comment_author = &event.comment.user.login;
    let comment_body = &event.comment.body;

    // only commands are handled
    if !comment_body.trim_start().starts_with('/') {
        return Ok(());
    }

    let commenter = Commenter::new(Arc::clone(&forge), owner.clone(), repo.clone());

    let mut bot_user = false;
    if comment_author.ends_with("[bot]") {
        if !comment_author.starts_with(&owner) {
            let comment = format!("Issue comment was created by an unsupported bot: {comment_author}");
            debug!("{comment}");
            let _ = commenter.comment_on_pull_request(pr_number, &comment).await;
            return Ok(());
        }
        bot_user = true;
    }

    let pr = match get_pull_request(forge.as_ref(), &owner, &repo, pr_number, max_retry_attempts)
        .await
    {
        Ok(pr) => pr,
        Err(err) => {
            let comment = format!("Failed to retrieve pull request: {err}");
            error!("{comment}");
            let _ = commenter.comment_on_pull_request(pr_number, &comment).await;
            return Err(err);
        }
    };

    let (context_ref, head_sha, base_sha) = determine_context_ref(&pr, &owner, &repo);

    let config = match fetch_repo_config(forge.as_ref(), &owner, &repo, &context_ref).await {
        Ok(config) => config,
        Err(err) => {
            error!("failed to retrieve config file: {err:#}");
            let _ = commenter
                .comment_on_pull_request(pr_number, "Failed to retrieve config file")
                .await;
            return Err(err);
        }
    };

    if !bot_user && !is_allowed_team_member(forge.as_ref(), &config, &owner, comment_author).await {
        if config.verbose() {
            let comment = format!("Comment by {comment_author} not allowed");
            let _ = commenter.comment_on_pull_request(pr_number, &comment).await;
        }
        return Ok(());
    }

    let Some(matched) = config.check_for_trigger(comment_body) else {
        if config.verbose() {
            let comment = format!("Command {comment_body} not found");
            let _ = commenter.comment_on_pull_request(pr_number, &comment).await;
        }
        return Ok(());
    };

    commenter.react_to_comment(event.comment.id, "eyes").await?;

    let verbose = config.verbose();
    let processor = WorkflowProcessor {
        forge: Arc::clone(&forge),
        owner,
        repo,
        config,
        run_delay,
    };

    if let Err(err) = processor
        .process_workflows_for_trigger(
            &matched,
            pr_number,
            &context_ref,
            &head_sha,
            &base_sha,
            &commenter,
        )
        .await
    {
        let comment = format!("Failed to process workflows for trigger: {err}");
        error!("{comment}");
        if verbose {
            let _ = commenter.comment_on_pull_request(pr_number, &comment).await;
        }
        return Err(err);
    }

    commenter.react_to_comment(event.comment.id, "rocket").await?;
    Ok(())
}

// ── pull_request ──────────────────────────────────────────────────────────

pub async fn handle_pull_request(
    forge: Arc<dyn Forge>,
    event: &PullRequestEvent,
    run_delay: Duration,
    max_retry_attempts: u32,
) -> Result<()> {
    if !ALLOWED_PR_ACTIONS.contains(&event.action.as_str()) {
        debug!(
            "pull request action is not any of {ALLOWED_PR_ACTIONS:?}; skipping"
        );
        return Ok(());
    }

    let owner = event.repository.owner.login.clone();
    let repo = event.repository.name.clone();
    let pr_number = event.pull_request.number;

    let commenter = Commenter::new(Arc::clone(&forge), owner.clone(), repo.clone());

    let pr = match get_pull_request(forge.as_ref(), &owner, &repo, pr_number, max_retry_attempts)
        .await
    {
        Ok(pr) => pr,
        Err(err) => {
            let comment = format!("Failed to retrieve pull request: {err}");
            error!("{comment}");
            let _ = commenter.comment_on_pull_request(pr_number, &comment).await;
            return Err(err);
        }
    };

    let (context_ref, head_sha, base_sha) = determine_context_ref(&pr, &owner, &repo);
    debug!("determined context {context_ref} ({head_sha}, {base_sha}) for configuration retrieval");

    let config = match fetch_repo_config(forge.as_ref(), &owner, &repo, &context_ref).await {
        Ok(config) => config,
        Err(err) => {
            error!("failed to retrieve config file: {err:#}");
            let _ = commenter
                .comment_on_pull_request(pr_number, "Failed to retrieve config file")
                .await;
            return Err(err);
        }
    };

    let Some(matched) = config.check_for_trigger(DEFAULT_RUN_TRIGGER) else {
        debug!("no matches for {DEFAULT_RUN_TRIGGER} trigger");
        return Ok(());
    };

    commenter.react_to_pr(pr_number, "eyes").await?;

    let verbose = config.verbose();
    let processor = WorkflowProcessor {
        forge: Arc::clone(&forge),
        owner,
        repo,
        config,
        run_delay,
    };

    if let Err(err) = processor
        .process_workflows_for_trigger(
            &matched,
            pr_number,
            &context_ref,
            &head_sha,
            &base_sha,
            &commenter,
        )
        .await
    {
        let comment = format!("Failed to process workflows for trigger: {err}");
        error!("{comment}");
        if verbose {
            let _ = commenter.comment_on_pull_request(pr_number, &comment).await;
        }
        return Err(err);
    }

    commenter.react_to_pr(pr_number, "rocket").await?;
    Ok(())
}

// ── workflow_run ──────────────────────────────────────────────────────────

pub async fn handle_workflow_run(
    forge: Arc<dyn Forge>,
    event: &WorkflowRunEvent,
    run_delay: Duration,
) -> Result<()> {
    if event.action != "completed" {
        return Ok(());
    }

    let workflow_run = &event.workflow_run;
    let conclusion = workflow_run.conclusion.as_deref().unwrap_or_default();

    if workflow_run.pull_requests.is_empty() {
        debug!("no pull requests associated with this workflow run");
        return Ok(());
    }

    let owner = event.repository.owner.login.clone();
    let repo = event.repository.name.clone();

    // The run payload does not carry PR creators; fetch each PR and keep
    // the last one whose creator is authorized (owned bot or allowlisted).
    let mut authorized_pr: Option<PullRequest> = None;
    let mut config: Option<ArianeConfig> = None;

    for pr_ref in &workflow_run.pull_requests {
        let pr = match forge.pull_request(&owner, &repo, pr_ref.number).await {
            Ok(pr) => pr,
            Err(err) => {
                error!("failed to get PR #{} details: {err:#}", pr_ref.number);
                continue;
            }
        };

        if config.is_none() {
            let (context_ref, _, _) = determine_context_ref(&pr, &owner, &repo);
            match fetch_repo_config(forge.as_ref(), &owner, &repo, &context_ref).await {
                Ok(fetched) => config = Some(fetched),
                Err(err) => {
                    debug!("failed to retrieve ariane config: {err:#}");
                    return Ok(());
                }
            }
        }

        let creator = pr.user.login.clone();
        if !is_owned_bot(&creator, &owner) {
            debug!(
                "PR #{} creator '{creator}' does not match the bot convention, checking config",
                pr.number
            );
            let allowed = match config.as_ref() {
                Some(cfg) => is_allowed_team_member(forge.as_ref(), cfg, &owner, &creator).await,
                None => false,
            };
            if !allowed {
                debug!(
                    "PR #{} creator '{creator}' is not an allowed team member, skipping",
                    pr.number
                );
                authorized_pr = None;
                continue;
            }
        }
        authorized_pr = Some(pr);
    }

    let Some(pull_request) = authorized_pr else {
        info!("no pull requests with allowed creators associated with this workflow run");
        return Ok(());
    };
    // config was loaded when the PR above was fetched
    let Some(config) = config else {
        return Ok(());
    };

    match conclusion {
        "success" => {
            handle_successful_run(forge, event, &pull_request, &owner, &repo, config, run_delay)
                .await
        }
        "failure" => handle_failed_run(forge.as_ref(), event, &owner, &repo, &config).await,
        other => {
            debug!("workflow run conclusion is '{other}', not handling");
            Ok(())
        }
    }
}

/// Successful runs feed the stage chainer and the dependent-trigger
/// chainer; both run, and their errors are combined.
async fn handle_successful_run(
    forge: Arc<dyn Forge>,
    event: &WorkflowRunEvent,
    pull_request: &PullRequest,
    owner: &str,
    repo: &str,
    config: ArianeConfig,
    run_delay: Duration,
) -> Result<()> {
    let processor = WorkflowProcessor {
        forge,
        owner: owner.to_string(),
        repo: repo.to_string(),
        config,
        run_delay,
    };

    let mut errors = Vec::new();
    if let Err(err) = processor
        .process_stages(pull_request, &event.workflow.path, &event.workflow_run)
        .await
    {
        errors.push(format!("stages: {err}"));
    }
    if let Err(err) = processor
        .process_dependent_triggers(pull_request, &event.workflow_run)
        .await
    {
        errors.push(format!("dependent triggers: {err}"));
    }
    if !errors.is_empty() {
        bail!(errors.join("; "));
    }
    Ok(())
}

/// Bounded rerun policy for failed runs: exclude list beats include list,
/// the attempt count must not exceed `max-retries`, and a rerun is only
/// issued when a failed job exists.
async fn handle_failed_run(
    forge: &dyn Forge,
    event: &WorkflowRunEvent,
    owner: &str,
    repo: &str,
    config: &ArianeConfig,
) -> Result<()> {
    let run_id = event.workflow_run.id;
    let workflow_name = &event.workflow.name;
    let workflow_path = &event.workflow.path;

    info!("workflow '{workflow_name}' (run ID: {run_id}) failed, checking if rerun is needed");

    let Some(rerun) = &config.rerun else {
        debug!("no rerun configuration found, skipping workflow '{workflow_path}' rerun");
        return Ok(());
    };

    if rerun
        .exclude_workflows
        .iter()
        .any(|excluded| workflow_path.contains(excluded.as_str()))
    {
        debug!("workflow '{workflow_path}' is in the exclude list, skipping rerun");
        return Ok(());
    }

    if !rerun.workflows.is_empty() {
        if !rerun
            .workflows
            .iter()
            .any(|allowed| workflow_path.contains(allowed.as_str()))
        {
            debug!("workflow '{workflow_path}' is not in the rerun allowed list, skipping");
            return Ok(());
        }
        debug!("workflow '{workflow_path}' is in the rerun allowed list");
    } else {
        debug!("no workflow restrictions configured, allowing rerun for all workflows");
    }

    let run = forge
        .workflow_run(owner, repo, run_id)
        .await
        .map_err(|err| anyhow!("failed to get workflow run {run_id}: {err}"))?;

    let attempt = run.run_attempt;
    debug!("workflow run {run_id} is at attempt {attempt} (max retries: {})", rerun.max_retries);
    if attempt > rerun.max_retries {
        info!(
            "workflow run {run_id} has reached max retries ({}/{}), not rerunning",
            attempt - 1,
            rerun.max_retries
        );
        return Ok(());
    }
    info!("proceeding with rerun (attempt {attempt}/{})", rerun.max_retries);

    rerun_failed_jobs(forge, owner, repo, run_id, workflow_name).await?;
    info!("successfully triggered rerun for workflow '{workflow_name}'");
    Ok(())
}

/// Issue a rerun-failed-jobs request when the run has a failed job.
async fn rerun_failed_jobs(
    forge: &dyn Forge,
    owner: &str,
    repo: &str,
    run_id: u64,
    workflow_name: &str,
) -> Result<()> {
    let jobs = forge
        .workflow_jobs(owner, repo, run_id, Some("latest"), 100)
        .await
        .map_err(|err| anyhow!("failed to list workflow jobs for run ID {run_id}: {err}"))?;

    let failed = jobs
        .iter()
        .find(|job| job.conclusion.as_deref() == Some("failure"));
    let Some(job) = failed else {
        debug!("no failed jobs found for workflow '{workflow_name}' (run ID: {run_id})");
        return Ok(());
    };
    debug!("found failed job: {} (ID: {})", job.name, job.id);

    info!("re-running failed jobs for workflow '{workflow_name}' (run ID: {run_id})");
    forge
        .rerun_failed_jobs(owner, repo, run_id)
        .await
        .map_err(|err| anyhow!("failed to re-run workflow '{workflow_name}' (run ID: {run_id}): {err}"))?;
    Ok(())
}

// ── merge_group ───────────────────────────────────────────────────────────

/// Merge-queue entries only need the any-source check satisfied; workflows
/// for the merged result were already exercised on the PR.
pub async fn handle_merge_group(forge: Arc<dyn Forge>, event: &MergeGroupEvent) -> Result<()> {
    if event.action != "checks_requested" {
        return Ok(());
    }
    let owner = &event.repository.owner.login;
    let repo = &event.repository.name;
    let head_sha = &event.merge_group.head_sha;

    info!("marking {ANY_SOURCE_CHECK} check satisfied for merge group head {head_sha}");
    forge
        .create_check_run(owner, repo, ANY_SOURCE_CHECK, head_sha, "completed", "success")
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{BranchRef, Repository, User};

    fn pr(head_owner: &str, head_repo: &str) -> PullRequest {
        PullRequest {
            number: 7,
            state: "open".into(),
            user: User {
                login: "dev".into(),
            },
            head: BranchRef {
                ref_name: "feature".into(),
                sha: "headsha".into(),
                repo: Some(Repository {
                    name: head_repo.into(),
                    owner: User {
                        login: head_owner.into(),
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

    #[test]
    fn same_repo_pr_uses_head_ref() {
        let (context_ref, head, base) = determine_context_ref(&pr("owner", "repo"), "owner", "repo");
        assert_eq!(context_ref, "feature");
        assert_eq!(head, "headsha");
        assert_eq!(base, "basesha");
    }

    #[test]
    fn fork_pr_uses_base_ref() {
        let (context_ref, _, _) = determine_context_ref(&pr("fork", "repo"), "owner", "repo");
        assert_eq!(context_ref, "main");
    }

    #[test]
    fn missing_head_repo_counts_as_fork() {
        let mut pr = pr("owner", "repo");
        pr.head.repo = None;
        let (context_ref, _, _) = determine_context_ref(&pr, "owner", "repo");
        assert_eq!(context_ref, "main");
    }

    #[test]
    fn bot_convention() {
        assert!(is_owned_bot("cilium-maintainer[bot]", "cilium"));
        assert!(!is_owned_bot("renovate[bot]", "cilium"));
        assert!(!is_owned_bot("cilium-maintainer", "cilium"));
    }
}
