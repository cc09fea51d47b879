use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::server_config::GithubConfig;

// ── API models ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub owner: User,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

/// One side of a pull request (head or base).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: String,
    #[serde(default)]
    pub repo: Option<Repository>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub user: User,
    pub head: BranchRef,
    pub base: BranchRef,
    #[serde(default)]
    pub labels: Vec<Label>,
}

impl PullRequest {
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name == name)
    }
}

/// A file touched by a pull request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitFile {
    pub filename: String,
}

/// Minimal PR reference as embedded in workflow_run payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub head_sha: String,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_attempt")]
    pub run_attempt: i64,
    #[serde(default)]
    pub pull_requests: Vec<PullRequestRef>,
}

fn default_attempt() -> i64 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

/// A workflow definition as known to the forge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub user: User,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamMembership {
    pub state: String,
}

/// Request body for a workflow_dispatch event. Input values are strings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowDispatch {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub inputs: HashMap<String, String>,
}

// ── Forge capability trait ────────────────────────────────────────────────

/// Everything the handlers need from the forge's REST surface.
/// Implemented by [`GithubClient`]; tests substitute a scripted mock.
#[async_trait]
pub trait Forge: Send + Sync {
    async fn pull_request(&self, owner: &str, repo: &str, number: u64) -> Result<PullRequest>;

    /// All files of a PR, paginated internally.
    async fn pull_request_files(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<CommitFile>>;

    /// Raw contents of a file at a ref.
    async fn file_contents(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<String>;

    /// Team membership for a user; `None` when the forge reports 404.
    async fn team_membership(
        &self,
        org: &str,
        team: &str,
        user: &str,
    ) -> Result<Option<TeamMembership>>;

    /// Workflow runs for a workflow file at a head SHA, most recent first.
    async fn workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow: &str,
        head_sha: &str,
        per_page: u32,
    ) -> Result<Vec<WorkflowRun>>;

    async fn workflow_run(&self, owner: &str, repo: &str, run_id: u64) -> Result<WorkflowRun>;

    async fn workflow_jobs(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
        filter: Option<&str>,
        per_page: u32,
    ) -> Result<Vec<WorkflowJob>>;

    /// Workflow metadata (display name) by file name.
    async fn workflow(&self, owner: &str, repo: &str, workflow: &str) -> Result<Workflow>;

    async fn issue_comments_since(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        since: DateTime<Utc>,
        per_page: u32,
    ) -> Result<Vec<IssueComment>>;

    async fn dispatch_workflow(
        &self,
        owner: &str,
        repo: &str,
        workflow: &str,
        event: &WorkflowDispatch,
    ) -> Result<()>;

    /// Create a completed check run on a commit.
    async fn create_check_run(
        &self,
        owner: &str,
        repo: &str,
        name: &str,
        head_sha: &str,
        status: &str,
        conclusion: &str,
    ) -> Result<()>;

    async fn create_comment(&self, owner: &str, repo: &str, number: u64, body: &str)
        -> Result<()>;

    async fn create_comment_reaction(
        &self,
        owner: &str,
        repo: &str,
        comment_id: u64,
        reaction: &str,
    ) -> Result<()>;

    async fn create_issue_reaction(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        reaction: &str,
    ) -> Result<()>;

    async fn rerun_failed_jobs(&self, owner: &str, repo: &str, run_id: u64) -> Result<()>;

    async fn rerun_job(&self, owner: &str, repo: &str, job_id: u64) -> Result<()>;
}

// ── REST client ───────────────────────────────────────────────────────────

/// Page size for PR file listing.
const FILES_PER_PAGE: u32 = 500;

#[derive(Deserialize)]
struct WorkflowRunsPage {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Deserialize)]
struct WorkflowJobsPage {
    #[serde(default)]
    jobs: Vec<WorkflowJob>,
}

pub struct GithubClient {
    base_url: String,
    token: String,
    client: Client,
}

impl GithubClient {
    pub fn new(base_url: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("ariane/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let resp = self
            .client
            .get(self.url(path))
            .query(query)
            .bearer_auth(&self.token)
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("GET {path} returned {status}");
        }
        resp.json().await.with_context(|| format!("GET {path}: decoding response"))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<()> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .bearer_auth(&self.token)
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("POST {path} returned {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl Forge for GithubClient {
    async fn pull_request(&self, owner: &str, repo: &str, number: u64) -> Result<PullRequest> {
        self.get_json(&format!("/repos/{owner}/{repo}/pulls/{number}"), &[])
            .await
    }

    async fn pull_request_files(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<CommitFile>> {
        let mut files = Vec::new();
        let mut page = 1u32;
        loop {
            let batch: Vec<CommitFile> = self
                .get_json(
                    &format!("/repos/{owner}/{repo}/pulls/{number}/files"),
                    &[
                        ("per_page", FILES_PER_PAGE.to_string()),
                        ("page", page.to_string()),
                    ],
                )
                .await?;
            let done = (batch.len() as u32) < FILES_PER_PAGE;
            files.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        Ok(files)
    }

    async fn file_contents(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<String> {
        let api_path = format!("/repos/{owner}/{repo}/contents/{path}");
        let resp = self
            .client
            .get(self.url(&api_path))
            .query(&[("ref", git_ref)])
            .bearer_auth(&self.token)
            // raw media type avoids base64 juggling
            .header("Accept", "application/vnd.github.raw+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .with_context(|| format!("GET {api_path}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("GET {api_path} returned {status}");
        }
        resp.text().await.context("reading file contents")
    }

    async fn team_membership(
        &self,
        org: &str,
        team: &str,
        user: &str,
    ) -> Result<Option<TeamMembership>> {
        let path = format!("/orgs/{org}/teams/{team}/memberships/{user}");
        let resp = self
            .client
            .get(self.url(&path))
            .bearer_auth(&self.token)
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        match resp.status() {
            s if s.is_success() => Ok(Some(resp.json().await?)),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s => bail!("GET {path} returned {s}"),
        }
    }

    async fn workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow: &str,
        head_sha: &str,
        per_page: u32,
    ) -> Result<Vec<WorkflowRun>> {
        let page: WorkflowRunsPage = self
            .get_json(
                &format!("/repos/{owner}/{repo}/actions/workflows/{workflow}/runs"),
                &[
                    ("head_sha", head_sha.to_string()),
                    ("per_page", per_page.to_string()),
                ],
            )
            .await?;
        Ok(page.workflow_runs)
    }

    async fn workflow_run(&self, owner: &str, repo: &str, run_id: u64) -> Result<WorkflowRun> {
        self.get_json(&format!("/repos/{owner}/{repo}/actions/runs/{run_id}"), &[])
            .await
    }

    async fn workflow_jobs(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
        filter: Option<&str>,
        per_page: u32,
    ) -> Result<Vec<WorkflowJob>> {
        let mut query = vec![("per_page", per_page.to_string())];
        if let Some(filter) = filter {
            query.push(("filter", filter.to_string()));
        }
        let page: WorkflowJobsPage = self
            .get_json(
                &format!("/repos/{owner}/{repo}/actions/runs/{run_id}/jobs"),
                &query,
            )
            .await?;
        Ok(page.jobs)
    }

    async fn workflow(&self, owner: &str, repo: &str, workflow: &str) -> Result<Workflow> {
        self.get_json(
            &format!("/repos/{owner}/{repo}/actions/workflows/{workflow}"),
            &[],
        )
        .await
    }

    async fn issue_comments_since(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        since: DateTime<Utc>,
        per_page: u32,
    ) -> Result<Vec<IssueComment>> {
        self.get_json(
            &format!("/repos/{owner}/{repo}/issues/{number}/comments"),
            &[
                ("since", since.to_rfc3339()),
                ("per_page", per_page.to_string()),
            ],
        )
        .await
    }

    async fn dispatch_workflow(
        &self,
        owner: &str,
        repo: &str,
        workflow: &str,
        event: &WorkflowDispatch,
    ) -> Result<()> {
        self.post_json(
            &format!("/repos/{owner}/{repo}/actions/workflows/{workflow}/dispatches"),
            &serde_json::to_value(event)?,
        )
        .await
    }

    async fn create_check_run(
        &self,
        owner: &str,
        repo: &str,
        name: &str,
        head_sha: &str,
        status: &str,
        conclusion: &str,
    ) -> Result<()> {
        self.post_json(
            &format!("/repos/{owner}/{repo}/check-runs"),
            &json!({
                "name": name,
                "head_sha": head_sha,
                "status": status,
                "conclusion": conclusion,
            }),
        )
        .await
    }

    async fn create_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<()> {
        self.post_json(
            &format!("/repos/{owner}/{repo}/issues/{number}/comments"),
            &json!({ "body": body }),
        )
        .await
    }

    async fn create_comment_reaction(
        &self,
        owner: &str,
        repo: &str,
        comment_id: u64,
        reaction: &str,
    ) -> Result<()> {
        self.post_json(
            &format!("/repos/{owner}/{repo}/issues/comments/{comment_id}/reactions"),
            &json!({ "content": reaction }),
        )
        .await
    }

    async fn create_issue_reaction(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        reaction: &str,
    ) -> Result<()> {
        self.post_json(
            &format!("/repos/{owner}/{repo}/issues/{number}/reactions"),
            &json!({ "content": reaction }),
        )
        .await
    }

    async fn rerun_failed_jobs(&self, owner: &str, repo: &str, run_id: u64) -> Result<()> {
        self.post_json(
            &format!("/repos/{owner}/{repo}/actions/runs/{run_id}/rerun-failed-jobs"),
            &json!({}),
        )
        .await
    }

    async fn rerun_job(&self, owner: &str, repo: &str, job_id: u64) -> Result<()> {
        self.post_json(
            &format!("/repos/{owner}/{repo}/actions/jobs/{job_id}/rerun"),
            &json!({}),
        )
        .await
    }
}

// ── Installation client pool ──────────────────────────────────────────────

/// Refresh installation tokens this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct InstallationToken {
    token: String,
    expires_at: DateTime<Utc>,
}

struct CachedClient {
    client: Arc<GithubClient>,
    expires_at: DateTime<Utc>,
}

/// Caches one authenticated [`GithubClient`] per app installation.
/// Tokens are minted with a short-lived RS256 app JWT and renewed lazily.
pub struct ClientPool {
    api_url: String,
    integration_id: u64,
    encoding_key: EncodingKey,
    timeout: Duration,
    http: Client,
    clients: tokio::sync::Mutex<HashMap<u64, CachedClient>>,
}

impl ClientPool {
    pub fn new(github: &GithubConfig, timeout: Duration) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(github.app.private_key.as_bytes())
            .context("parsing GitHub app private key")?;
        let http = Client::builder()
            .user_agent(concat!("ariane/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            api_url: github.v3_api_url.trim_end_matches('/').to_string(),
            integration_id: github.app.integration_id,
            encoding_key,
            timeout,
            http,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    fn app_jwt(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            // backdated to tolerate clock drift
            iat: now - 60,
            exp: now + 540,
            iss: self.integration_id.to_string(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .context("signing app JWT")
    }

    async fn mint_token(&self, installation_id: u64) -> Result<InstallationToken> {
        let url = format!(
            "{}/app/installations/{installation_id}/access_tokens",
            self.api_url
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(self.app_jwt()?)
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .context("requesting installation token")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("installation token request for {installation_id} returned {status}");
        }
        Ok(resp.json().await?)
    }

    /// Client authenticated for the given installation, minting or reusing
    /// a cached token.
    pub async fn installation_client(&self, installation_id: u64) -> Result<Arc<GithubClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(cached) = clients.get(&installation_id) {
            if cached.expires_at - TOKEN_EXPIRY_MARGIN > Utc::now() {
                return Ok(Arc::clone(&cached.client));
            }
        }

        let token = self.mint_token(installation_id).await?;
        debug!(
            installation_id,
            expires_at = %token.expires_at,
            "minted installation token"
        );
        let client = Arc::new(GithubClient::new(&self.api_url, token.token, self.timeout)?);
        clients.insert(
            installation_id,
            CachedClient {
                client: Arc::clone(&client),
                expires_at: token.expires_at,
            },
        );
        Ok(client)
    }
}
