use std::collections::HashMap;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::github::{CommitFile, Forge};

/// Location of the repository configuration, fetched at the context ref.
pub const CONFIG_PATH: &str = ".github/ariane-config.yaml";

/// Directory holding workflow definitions.
pub const WORKFLOW_DIR: &str = ".github/workflows/";

// ── Schema ────────────────────────────────────────────────────────────────

/// Per-repository configuration: trigger phrases, per-workflow path policy,
/// allowlisted teams, rerun policy and staged pipelines.
///
/// Unknown top-level keys are a fatal parse error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArianeConfig {
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub triggers: HashMap<String, TriggerConfig>,
    #[serde(default)]
    pub workflows: HashMap<String, WorkflowPathsConfig>,
    #[serde(default, rename = "allowed-teams")]
    pub allowed_teams: Vec<String>,
    #[serde(default)]
    pub rerun: Option<RerunConfig>,
    #[serde(default, rename = "stages-config")]
    pub stages_config: Option<StagesConfig>,
    /// Accepted but not interpreted by the service.
    #[serde(default)]
    pub schedule: Option<serde_yaml::Value>,

    /// Trigger phrases compiled once at load time.
    #[serde(skip)]
    trigger_regexes: HashMap<String, Regex>,
    /// Path regexes compiled once at load time, anchored at path start.
    #[serde(skip)]
    path_regexes: HashMap<String, Regex>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackConfig {
    #[serde(default)]
    pub verbose: Option<bool>,
    #[serde(default, rename = "workflows-report")]
    pub workflows_report: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Workflows dispatched when the phrase matches, in declaration order.
    #[serde(default)]
    pub workflows: Vec<String>,
    /// Trigger phrases that must have completed successfully first.
    #[serde(default, rename = "depends-on")]
    pub depends_on: Vec<String>,
}

/// Path policy for one workflow. At most one of the two regexes may be set;
/// the empty string means unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPathsConfig {
    #[serde(default, rename = "paths-regex", skip_serializing_if = "String::is_empty")]
    pub paths_regex: String,
    #[serde(
        default,
        rename = "paths-ignore-regex",
        skip_serializing_if = "String::is_empty"
    )]
    pub paths_ignore_regex: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerunConfig {
    #[serde(default, rename = "max-retries")]
    pub max_retries: i64,
    /// Substrings selecting workflows eligible for rerun. Empty = all.
    #[serde(default)]
    pub workflows: Vec<String>,
    /// Substrings excluding workflows from rerun; beats the include list.
    #[serde(default, rename = "exclude-workflows")]
    pub exclude_workflows: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagesConfig {
    /// PR label gating staged advancement.
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub workflows: Vec<String>,
    pub command: String,
}

/// Result of matching a comment body against the configured triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerMatch {
    /// Full match followed by captured groups (empty string when a group
    /// did not participate).
    pub submatch: Vec<String>,
    pub workflows: Vec<String>,
    pub depends_on: Vec<String>,
}

// ── Parse / validate / merge ──────────────────────────────────────────────

impl ArianeConfig {
    /// Parse a YAML document and compile its regexes. Validation is a
    /// separate step so callers can aggregate every error at once.
    pub fn parse(doc: &str) -> Result<Self> {
        let mut config: ArianeConfig =
            serde_yaml::from_str(doc).context("failed to parse ariane config")?;
        config.compile_regexes();
        Ok(config)
    }

    fn compile_regexes(&mut self) {
        self.trigger_regexes = self
            .triggers
            .keys()
            .filter_map(|phrase| Regex::new(phrase).ok().map(|re| (phrase.clone(), re)))
            .collect();
        self.path_regexes = self
            .workflows
            .values()
            .flat_map(|w| [&w.paths_regex, &w.paths_ignore_regex])
            .filter(|pattern| !pattern.is_empty())
            .filter_map(|pattern| {
                anchored(pattern).ok().map(|re| (pattern.clone(), re))
            })
            .collect();
    }

    /// Check every invariant, returning all violations.
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();

        for (phrase, trigger) in &self.triggers {
            if trigger.workflows.is_empty() {
                errs.push(format!("trigger {phrase:?} has no workflows"));
            }
            if let Err(err) = Regex::new(phrase) {
                errs.push(format!("trigger {phrase:?} is not a valid regex: {err}"));
            }
            for dep in &trigger.depends_on {
                if !self.triggers.contains_key(dep) {
                    errs.push(format!(
                        "trigger {phrase:?} depends on {dep:?}, which is not defined as a trigger"
                    ));
                }
            }
        }

        if let Some(cycle) = self.find_dependency_cycle() {
            errs.push(format!(
                "trigger dependency graph contains a cycle through {cycle:?}"
            ));
        }

        for (workflow, paths) in &self.workflows {
            if !paths.paths_regex.is_empty() {
                if let Err(err) = Regex::new(&paths.paths_regex) {
                    errs.push(format!(
                        "workflow {workflow:?} has invalid paths-regex {:?}: {err}",
                        paths.paths_regex
                    ));
                }
            }
            if !paths.paths_ignore_regex.is_empty() {
                if let Err(err) = Regex::new(&paths.paths_ignore_regex) {
                    errs.push(format!(
                        "workflow {workflow:?} has invalid paths-ignore-regex {:?}: {err}",
                        paths.paths_ignore_regex
                    ));
                }
            }
            if !paths.paths_regex.is_empty() && !paths.paths_ignore_regex.is_empty() {
                errs.push(format!(
                    "workflow {workflow:?} defines both paths-regex and paths-ignore-regex, \
                     which is unsupported"
                ));
            }
        }

        if let Some(rerun) = &self.rerun {
            if rerun.max_retries < 0 {
                errs.push(format!(
                    "rerun max-retries must be non-negative, got {}",
                    rerun.max_retries
                ));
            }
        }

        if let Some(stages) = &self.stages_config {
            for (i, stage) in stages.stages.iter().enumerate() {
                if stage.workflows.is_empty() {
                    errs.push(format!("stage[{i}] has no workflows"));
                }
                if stage.command.is_empty() {
                    errs.push(format!("stage[{i}] has no command"));
                }
            }
        }

        errs
    }

    /// Iterative DFS over the depends-on graph; a back edge is a cycle.
    fn find_dependency_cycle(&self) -> Option<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for start in self.triggers.keys() {
            if marks.contains_key(start.as_str()) {
                continue;
            }
            // stack of (node, next-edge-index)
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), Mark::Visiting);
            while let Some((node, edge)) = stack.pop() {
                let deps = self
                    .triggers
                    .get(node)
                    .map(|t| t.depends_on.as_slice())
                    .unwrap_or_default();
                if edge < deps.len() {
                    stack.push((node, edge + 1));
                    let dep = deps[edge].as_str();
                    match marks.get(dep) {
                        Some(Mark::Visiting) => return Some(dep.to_string()),
                        Some(Mark::Done) => {}
                        None if self.triggers.contains_key(dep) => {
                            marks.insert(dep, Mark::Visiting);
                            stack.push((dep, 0));
                        }
                        // dangling dependency, reported separately
                        None => {}
                    }
                } else {
                    marks.insert(node, Mark::Done);
                }
            }
        }
        None
    }

    /// Layer `other` on top of `self`: trigger workflow lists concatenate,
    /// workflow entries from `other` win on collision, allowed teams union
    /// in order, and scalar sections from `other` override when set.
    pub fn merge(&self, other: &ArianeConfig) -> ArianeConfig {
        let mut triggers = self.triggers.clone();
        for (phrase, trigger) in &other.triggers {
            match triggers.get_mut(phrase) {
                Some(existing) => {
                    existing.workflows.extend(trigger.workflows.iter().cloned());
                    existing.depends_on.extend(trigger.depends_on.iter().cloned());
                }
                None => {
                    triggers.insert(phrase.clone(), trigger.clone());
                }
            }
        }

        let mut workflows = self.workflows.clone();
        for (name, paths) in &other.workflows {
            workflows.insert(name.clone(), paths.clone());
        }

        let mut allowed_teams = self.allowed_teams.clone();
        for team in &other.allowed_teams {
            if !allowed_teams.contains(team) {
                allowed_teams.push(team.clone());
            }
        }

        let mut merged = ArianeConfig {
            feedback: FeedbackConfig {
                verbose: other.feedback.verbose.or(self.feedback.verbose),
                workflows_report: other
                    .feedback
                    .workflows_report
                    .or(self.feedback.workflows_report),
            },
            triggers,
            workflows,
            allowed_teams,
            rerun: other.rerun.clone().or_else(|| self.rerun.clone()),
            stages_config: other
                .stages_config
                .clone()
                .or_else(|| self.stages_config.clone()),
            schedule: other.schedule.clone().or_else(|| self.schedule.clone()),
            trigger_regexes: HashMap::new(),
            path_regexes: HashMap::new(),
        };
        merged.compile_regexes();
        merged
    }

    // ── Feedback accessors ────────────────────────────────────────────────

    pub fn verbose(&self) -> bool {
        self.feedback.verbose.unwrap_or(false)
    }

    pub fn workflows_report(&self) -> bool {
        self.feedback.workflows_report.unwrap_or(false)
    }

    /// Whether the decision engine reports non-failure outcomes too.
    pub fn report_all_workflows(&self) -> bool {
        self.verbose() && self.workflows_report()
    }

    // ── Trigger matching ──────────────────────────────────────────────────

    /// Match a comment body against the configured triggers. A trigger
    /// fires only when its regex matches the entire trimmed body; a prefix
    /// match is not a command.
    pub fn check_for_trigger(&self, body: &str) -> Option<TriggerMatch> {
        let body = body.trim();
        for (phrase, trigger) in &self.triggers {
            let compiled;
            let re = match self.trigger_regexes.get(phrase) {
                Some(re) => re,
                None => match Regex::new(phrase) {
                    Ok(re) => {
                        compiled = re;
                        &compiled
                    }
                    Err(err) => {
                        warn!("trigger {phrase:?} is not a valid regex: {err}");
                        continue;
                    }
                },
            };
            let Some(caps) = re.captures(body) else {
                continue;
            };
            let Some(full) = caps.get(0) else {
                continue;
            };
            if full.start() != 0 || full.end() != body.len() {
                continue;
            }
            let submatch = (0..caps.len())
                .map(|i| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect();
            debug!("comment matched trigger {phrase:?}");
            return Some(TriggerMatch {
                submatch,
                workflows: trigger.workflows.clone(),
                depends_on: trigger.depends_on.clone(),
            });
        }
        None
    }

    // ── Path-change evaluation ────────────────────────────────────────────

    /// Decide whether `workflow` must run for the given change set, using
    /// its `workflows` entry. Path regexes match from the start of the
    /// path. Falls through to the only-workflows rule when the entry sets
    /// neither regex.
    pub fn should_run_workflow(&self, workflow: &str, files: &[CommitFile]) -> bool {
        if files.is_empty() {
            return false;
        }
        let own_file = format!("{WORKFLOW_DIR}{workflow}");
        let paths = self.workflows.get(workflow).cloned().unwrap_or_default();

        if !paths.paths_regex.is_empty() && !paths.paths_ignore_regex.is_empty() {
            // rejected by validation; run rather than silently drop
            return true;
        }

        if !paths.paths_regex.is_empty() {
            let Some(re) = self.path_regex(&paths.paths_regex) else {
                return true;
            };
            return files
                .iter()
                .any(|f| f.filename == own_file || re.is_match(&f.filename));
        }

        if !paths.paths_ignore_regex.is_empty() {
            let Some(re) = self.path_regex(&paths.paths_ignore_regex) else {
                return true;
            };
            // a change to some other workflow's file is never a reason to run
            return files.iter().any(|f| {
                if f.filename.starts_with(WORKFLOW_DIR) && f.filename != own_file {
                    return false;
                }
                !re.is_match(&f.filename)
            });
        }

        self.should_run_only_workflows(workflow, files)
    }

    /// Rule for workflows without a `workflows` entry: run when anything
    /// outside `.github/workflows/` changed, or the workflow's own file
    /// did.
    pub fn should_run_only_workflows(&self, workflow: &str, files: &[CommitFile]) -> bool {
        let own_file = format!("{WORKFLOW_DIR}{workflow}");
        files
            .iter()
            .any(|f| !f.filename.starts_with(WORKFLOW_DIR) || f.filename == own_file)
    }

    fn path_regex(&self, pattern: &str) -> Option<Regex> {
        if let Some(re) = self.path_regexes.get(pattern) {
            return Some(re.clone());
        }
        match anchored(pattern) {
            Ok(re) => Some(re),
            Err(err) => {
                warn!("invalid path regex {pattern:?}: {err}");
                None
            }
        }
    }
}

/// Compile a path pattern anchored at the start of the path.
fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})"))
}

// ── Loading from the forge ────────────────────────────────────────────────

/// Fetch, parse and validate the repository configuration at a ref.
pub async fn fetch_repo_config(
    forge: &dyn Forge,
    owner: &str,
    repo: &str,
    git_ref: &str,
) -> Result<ArianeConfig> {
    let doc = forge
        .file_contents(owner, repo, CONFIG_PATH, git_ref)
        .await
        .with_context(|| format!("fetching {CONFIG_PATH} at {git_ref}"))?;
    let config = ArianeConfig::parse(&doc)?;
    let errs = config.validate();
    if !errs.is_empty() {
        anyhow::bail!("invalid ariane config: {}", errs.join("; "));
    }
    Ok(config)
}
