//! Worker lifecycle orchestration.
//!
//! The [`WorkerSupervisor`] owns the full spawn path (admission control,
//! snapshot branch, artifacts, session launch, monitoring) and the
//! reconciliation loop that turns dead sessions into registry transitions
//! and completion callbacks.
//!
//! Spawn order is deliberate: the feature id allow-list and policy engine
//! run before any side effect, the snapshot branch is best-effort, and the
//! session is only launched once every artifact it needs is on disk.

pub mod artifacts;
pub mod heartbeat;
pub mod monitor;
pub mod session;

pub use artifacts::{StatusRecord, WorkerRole, WorkspacePaths};
pub use heartbeat::HeartbeatInfo;
pub use monitor::{
    CompletionCallback, CompletionEvent, WaitOutcome, WorkerCheck, WorkerStatus, classify_status,
};
pub use session::{AgentLauncher, MemorySessionHost, SessionHost, TmuxSessionHost};

use anyhow::anyhow;
use chrono::Utc;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::conflict::{FeatureConflict, analyze_feature_conflicts};
use crate::enforcement::{EnforcementEngine, ExecutionContext, Violation};
use crate::error::SpawnError;
use crate::health::HealthMonitor;
use crate::registry::{Feature, FeatureRegistry, FeatureStatus, StateStore};
use crate::snapshot::SnapshotManager;

/// Feature ids double as file name stems and session name components, so
/// they are restricted to a strict allow-list.
static FEATURE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").unwrap());

/// Tools a review worker may use. Reviews never get write access.
const REVIEW_TOOLS: &[&str] = &["Read", "Grep", "Glob"];

/// Outcome of a spawn attempt, structured rather than thrown.
#[derive(Debug, Clone)]
pub struct SpawnResult {
    pub success: bool,
    pub session_name: Option<String>,
    pub error: Option<String>,
    pub violations: Vec<Violation>,
}

impl SpawnResult {
    fn ok(session_name: String) -> Self {
        Self {
            success: true,
            session_name: Some(session_name),
            error: None,
            violations: Vec::new(),
        }
    }

    fn from_error(err: SpawnError) -> Self {
        let violations = match &err {
            SpawnError::EnforcementBlocked { violations } => violations.clone(),
            _ => Vec::new(),
        };
        Self {
            success: false,
            session_name: None,
            error: Some(err.to_string()),
            violations,
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedWorker {
    feature_id: String,
    role: WorkerRole,
    last_status: WorkerStatus,
}

/// Orchestrates worker sessions for features.
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    registry: Mutex<FeatureRegistry>,
    engine: Arc<EnforcementEngine>,
    health: HealthMonitor,
    snapshots: SnapshotManager,
    host: Arc<dyn SessionHost>,
    workspace: WorkspacePaths,
    launcher: AgentLauncher,
    /// Live sessions keyed by session name. One feature can hold several
    /// entries at once (implementer plus a concurrent review).
    tracked: Mutex<HashMap<String, TrackedWorker>>,
    callbacks: Mutex<Vec<CompletionCallback>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    /// Build a supervisor with the tmux host and a git snapshot backend
    /// opened from the configured project directory.
    pub fn new(config: SupervisorConfig) -> anyhow::Result<Self> {
        let snapshots = SnapshotManager::open(&config.project_dir);
        let host = Arc::new(TmuxSessionHost::new());
        Self::with_parts(config, host, snapshots)
    }

    /// Build a supervisor from explicit ports. Tests inject in-memory
    /// hosts and temp-repo snapshot backends here.
    pub fn with_parts(
        config: SupervisorConfig,
        host: Arc<dyn SessionHost>,
        snapshots: SnapshotManager,
    ) -> anyhow::Result<Self> {
        config.ensure_directories()?;
        let workspace = WorkspacePaths::new(&config.workspace_dir);
        let health = HealthMonitor::new(&config.workspace_dir);
        let launcher = AgentLauncher::new(&config.agent_cmd);
        Ok(Self {
            config,
            registry: Mutex::new(FeatureRegistry::new()),
            engine: Arc::new(EnforcementEngine::with_defaults()),
            health,
            snapshots,
            host,
            workspace,
            launcher,
            tracked: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            monitor_task: Mutex::new(None),
        })
    }

    pub fn engine(&self) -> &Arc<EnforcementEngine> {
        &self.engine
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn workspace(&self) -> &WorkspacePaths {
        &self.workspace
    }

    pub fn register_feature(&self, feature: Feature) {
        self.registry.lock().expect("registry lock").insert(feature);
    }

    pub fn feature(&self, id: &str) -> Option<Feature> {
        self.registry
            .lock()
            .expect("registry lock")
            .get(id)
            .cloned()
    }

    pub fn features(&self) -> Vec<Feature> {
        self.registry.lock().expect("registry lock").all()
    }

    pub fn remove_feature(&self, id: &str) -> Option<Feature> {
        self.registry.lock().expect("registry lock").remove(id)
    }

    /// Queue a failed feature for another attempt and clear its stale
    /// completion marker.
    pub fn retry_feature(&self, id: &str) -> anyhow::Result<()> {
        self.registry.lock().expect("registry lock").retry(id)?;
        self.workspace.clear_done(id)?;
        Ok(())
    }

    /// Replace the registry contents from a state store.
    pub fn load_features(&self, store: &dyn StateStore) -> anyhow::Result<usize> {
        let features = store.load()?;
        let count = features.len();
        let mut registry = self.registry.lock().expect("registry lock");
        *registry = FeatureRegistry::from_features(features);
        Ok(count)
    }

    /// Persist the current registry contents to a state store.
    pub fn persist_features(&self, store: &dyn StateStore) -> anyhow::Result<()> {
        let features = self.registry.lock().expect("registry lock").all();
        store.save(&features)
    }

    // ---- Spawning ----

    /// Spawn an implementation worker for `feature`.
    pub async fn start_worker(&self, feature: &Feature, prompt: Option<&str>) -> SpawnResult {
        match self.spawn(feature, prompt, WorkerRole::Implementer).await {
            Ok(session) => SpawnResult::ok(session),
            Err(err) => {
                warn!(feature_id = %feature.id, error = %err, "Worker spawn failed");
                SpawnResult::from_error(err)
            }
        }
    }

    /// Spawn a planning worker. Planners emit `{id}.plan.json` instead of
    /// editing the repository.
    pub async fn start_planner_worker(&self, feature: &Feature, prompt: Option<&str>) -> SpawnResult {
        match self.spawn(feature, prompt, WorkerRole::Planner).await {
            Ok(session) => SpawnResult::ok(session),
            Err(err) => {
                warn!(feature_id = %feature.id, error = %err, "Planner spawn failed");
                SpawnResult::from_error(err)
            }
        }
    }

    /// Spawn a read-only review worker.
    pub async fn start_review_worker(&self, feature: &Feature, prompt: Option<&str>) -> SpawnResult {
        match self.spawn(feature, prompt, WorkerRole::Reviewer).await {
            Ok(session) => SpawnResult::ok(session),
            Err(err) => {
                warn!(feature_id = %feature.id, error = %err, "Review spawn failed");
                SpawnResult::from_error(err)
            }
        }
    }

    async fn spawn(
        &self,
        feature: &Feature,
        prompt: Option<&str>,
        role: WorkerRole,
    ) -> Result<String, SpawnError> {
        // Reject bad ids before touching anything.
        if !FEATURE_ID_REGEX.is_match(&feature.id) {
            return Err(SpawnError::InvalidFeatureId {
                id: feature.id.clone(),
            });
        }

        // Probe the host up front so an unreachable multiplexer refuses
        // the spawn without leaving artifacts behind.
        self.host
            .list()
            .await
            .map_err(|e| SpawnError::SessionHostUnavailable(e.to_string()))?;

        // Double-spawn checks are read-only; nothing is registered until
        // admission control has passed.
        if role == WorkerRole::Implementer {
            let registry = self.registry.lock().expect("registry lock");
            if registry.get(&feature.id).map(|f| f.status) == Some(FeatureStatus::InProgress) {
                return Err(SpawnError::Other(anyhow!(
                    "Feature {} already has an active worker",
                    feature.id
                )));
            }
        }
        {
            let tracked = self.tracked.lock().expect("tracked lock");
            let live = tracked.values().any(|w| {
                w.feature_id == feature.id
                    && w.role == role
                    && w.last_status == WorkerStatus::Running
            });
            if live {
                return Err(SpawnError::Other(anyhow!(
                    "Feature {} already has an active {} session",
                    feature.id,
                    role.as_str()
                )));
            }
        }

        let tools = self.tools_for(role);
        let key = role.artifact_key(&feature.id);
        let prompt_path = self.workspace.prompt_path(&key);
        let log_path = self.workspace.log_path(&key);
        let done_path = self.workspace.done_path(&key);
        let command = self
            .launcher
            .build_command(&prompt_path, &log_path, &done_path, &tools);

        // Admission control. A blocked or failed evaluation aborts before
        // any artifact exists.
        let context = ExecutionContext::spawn_worker(feature, &tools, &command);
        let verdict = self.engine.validate_pre_spawn(&context);
        for warning in &verdict.warnings {
            warn!(
                feature_id = %feature.id,
                constraint = %warning.constraint_id,
                "Pre-spawn warning: {}",
                warning.message
            );
        }
        if !verdict.allowed {
            return Err(SpawnError::EnforcementBlocked {
                violations: verdict.violations,
            });
        }

        {
            let mut registry = self.registry.lock().expect("registry lock");
            if !registry.contains(&feature.id) {
                registry.insert(feature.clone());
            }
        }

        // Snapshot branch is best effort. Implementers only; planners and
        // reviewers do not touch the working tree.
        if role == WorkerRole::Implementer {
            match self.snapshots.create_snapshot_branch(&feature.id) {
                Ok(Some(branch)) => debug!(feature_id = %feature.id, %branch, "Snapshot branch created"),
                Ok(None) => {}
                Err(e) => warn!(feature_id = %feature.id, error = %e, "Snapshot branch failed, continuing"),
            }
        }

        let prompt_text = match prompt {
            Some(p) => p.to_string(),
            None => self.default_prompt(feature, role),
        };
        self.workspace
            .write_prompt(&key, &prompt_text)
            .map_err(|source| SpawnError::ArtifactWriteFailed {
                kind: "prompt",
                path: prompt_path.clone(),
                source,
            })?;
        self.workspace
            .init_log(&key)
            .map_err(|source| SpawnError::ArtifactWriteFailed {
                kind: "log",
                path: log_path.clone(),
                source,
            })?;
        self.workspace
            .clear_done(&key)
            .map_err(|source| SpawnError::ArtifactWriteFailed {
                kind: "done marker",
                path: done_path.clone(),
                source,
            })?;

        let session_name = format!(
            "{}-{}-{}",
            role.as_str(),
            feature.id,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let record = StatusRecord {
            feature_id: feature.id.clone(),
            session_name: session_name.clone(),
            role,
            started_at: Utc::now(),
            prompt_file: prompt_path,
            log_file: log_path,
        };
        self.workspace
            .write_status(&key, &record)
            .map_err(|source| SpawnError::ArtifactWriteFailed {
                kind: "status",
                path: self.workspace.status_path(&key),
                source,
            })?;

        self.host
            .create(&session_name, &self.config.project_dir, &command)
            .await
            .map_err(|e| SpawnError::SessionHostUnavailable(e.to_string()))?;

        if role == WorkerRole::Implementer {
            self.registry
                .lock()
                .expect("registry lock")
                .mark_started(&feature.id, &session_name)
                .map_err(SpawnError::Other)?;
        }
        if role == WorkerRole::Implementer {
            self.health.reset(&feature.id);
        }
        self.engine.start_monitoring(&feature.id, &session_name);
        self.tracked.lock().expect("tracked lock").insert(
            session_name.clone(),
            TrackedWorker {
                feature_id: feature.id.clone(),
                role,
                last_status: WorkerStatus::Running,
            },
        );

        info!(feature_id = %feature.id, session = %session_name, role = ?role, "Worker session started");
        Ok(session_name)
    }

    fn tools_for(&self, role: WorkerRole) -> Vec<String> {
        match role {
            WorkerRole::Implementer | WorkerRole::Planner => self.config.allowed_tools.clone(),
            WorkerRole::Reviewer => REVIEW_TOOLS.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn default_prompt(&self, feature: &Feature, role: WorkerRole) -> String {
        match role {
            WorkerRole::Implementer => format!(
                "Implement the following feature in this repository.\n\n\
                 Feature: {}\n{}\n\n\
                 Work incrementally, verify your changes, and finish by \
                 summarizing what you changed.",
                feature.id, feature.description
            ),
            WorkerRole::Planner => format!(
                "Produce an implementation plan for the following feature.\n\n\
                 Feature: {}\n{}\n\n\
                 Write the plan as JSON to {} and do not modify any other file.",
                feature.id,
                feature.description,
                self.workspace.plan_path(&feature.id).display()
            ),
            WorkerRole::Reviewer => format!(
                "Review the changes made for the following feature.\n\n\
                 Feature: {}\n{}\n\n\
                 You have read-only access. Report problems with file and \
                 line references, then give an overall verdict.",
                feature.id, feature.description
            ),
        }
    }

    // ---- Polling ----

    /// Classify a session by name. Live host errors degrade to the last
    /// observed status instead of propagating.
    pub async fn check_worker(&self, session_name: &str, lines: usize) -> WorkerCheck {
        let identity = self.session_identity(session_name);
        let exists = match self.host.exists(session_name).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(session = %session_name, error = %e, "Session host unreachable during poll");
                let status = self
                    .last_observed(session_name)
                    .unwrap_or(WorkerStatus::NotFound);
                return WorkerCheck {
                    status,
                    recent_output: None,
                };
            }
        };

        let (marker, log) = match &identity {
            Some((role, id)) => {
                let key = role.artifact_key(id);
                (self.workspace.done_exists(&key), self.workspace.log_exists(&key))
            }
            None => (false, false),
        };
        let status = classify_status(exists, marker, log);
        let recent_output = if status == WorkerStatus::Running {
            self.host.capture_output(session_name, lines).await.ok()
        } else {
            None
        };
        WorkerCheck {
            status,
            recent_output,
        }
    }

    /// Poll every tracked worker, keyed by feature id. When a feature has
    /// both an implementer and an auxiliary session, the implementer's
    /// status wins.
    pub async fn check_all_workers(&self) -> BTreeMap<String, WorkerStatus> {
        let snapshot: Vec<(String, String, WorkerRole)> = {
            let tracked = self.tracked.lock().expect("tracked lock");
            tracked
                .iter()
                .map(|(s, w)| (s.clone(), w.feature_id.clone(), w.role))
                .collect()
        };
        let mut statuses = BTreeMap::new();
        for (session, feature_id, role) in snapshot {
            let check = self.check_worker(&session, 0).await;
            if role == WorkerRole::Implementer {
                statuses.insert(feature_id, check.status);
            } else {
                statuses.entry(feature_id).or_insert(check.status);
            }
        }
        statuses
    }

    /// Poll a review session. Review workers share the status signals of
    /// regular workers.
    pub async fn check_review_worker(&self, session_name: &str, lines: usize) -> WorkerCheck {
        self.check_worker(session_name, lines).await
    }

    /// Liveness summary for a feature's worker: last tool, recent files,
    /// elapsed time, and the current health score while running.
    pub async fn get_heartbeat_info(&self, feature_id: &str) -> HeartbeatInfo {
        let log_text =
            std::fs::read_to_string(self.workspace.log_path(feature_id)).unwrap_or_default();
        let status = self.workspace.read_status(feature_id);
        let mut info = heartbeat::heartbeat_from_log(feature_id, &log_text, status.as_ref());

        let running = match &info.session_name {
            Some(session) => self.host.exists(session).await.unwrap_or(false),
            None => false,
        };
        if running {
            info.confidence = Some(self.health.check(feature_id));
        }
        info
    }

    /// Kill every session for a feature immediately. Best effort: a
    /// session that is already gone is not an error, and the registry
    /// records the kill.
    pub async fn kill_worker(&self, feature_id: &str) {
        let sessions: Vec<String> = {
            let tracked = self.tracked.lock().expect("tracked lock");
            tracked
                .iter()
                .filter(|(_, w)| w.feature_id == feature_id)
                .map(|(s, _)| s.clone())
                .collect()
        };
        if sessions.is_empty() {
            return;
        }
        for session in &sessions {
            if let Err(e) = self.host.kill(session).await {
                debug!(feature_id, session = %session, error = %e, "Kill returned an error, ignoring");
            }
            let _ = self.engine.stop_monitoring(session);
            self.tracked.lock().expect("tracked lock").remove(session);
        }
        let mut registry = self.registry.lock().expect("registry lock");
        if registry
            .get(feature_id)
            .map(|f| f.status == FeatureStatus::InProgress)
            .unwrap_or(false)
        {
            let _ = registry.mark_failed(feature_id, "worker killed by supervisor");
        }
    }

    /// Pairwise overlap analysis across the given features.
    pub fn analyze_conflicts(&self, features: &[Feature]) -> Vec<FeatureConflict> {
        analyze_feature_conflicts(features)
    }

    // ---- Completion monitoring ----

    /// Register a callback fired exactly once per running-to-terminal edge.
    pub fn on_worker_completion(&self, callback: CompletionCallback) {
        self.callbacks.lock().expect("callbacks lock").push(callback);
    }

    /// Start the background reconciliation loop. Idempotent: a second call
    /// while a loop is running does nothing.
    pub fn start_completion_monitor(self: &Arc<Self>) {
        let mut task = self.monitor_task.lock().expect("monitor task lock");
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let supervisor = Arc::clone(self);
        let interval = self.config.poll_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                supervisor.reconcile().await;
            }
        }));
        info!(interval_secs = interval.as_secs(), "Completion monitor started");
    }

    pub fn stop_completion_monitor(&self) {
        if let Some(task) = self.monitor_task.lock().expect("monitor task lock").take() {
            task.abort();
            info!("Completion monitor stopped");
        }
    }

    /// One reconciliation pass: detect running-to-terminal edges, apply
    /// registry transitions, and fire callbacks.
    pub async fn reconcile(&self) {
        let snapshot: Vec<(String, TrackedWorker)> = {
            let tracked = self.tracked.lock().expect("tracked lock");
            tracked
                .iter()
                .map(|(id, w)| (id.clone(), w.clone()))
                .collect()
        };

        for (session, worker) in snapshot {
            // Features removed from the registry are pruned silently.
            if !self
                .registry
                .lock()
                .expect("registry lock")
                .contains(&worker.feature_id)
            {
                self.tracked.lock().expect("tracked lock").remove(&session);
                let _ = self.engine.stop_monitoring(&session);
                continue;
            }

            let check = self.check_worker(&session, 0).await;
            let current = check.status;
            if worker.last_status == WorkerStatus::Running && current.is_terminal() {
                self.handle_terminal_edge(&session, &worker, current);
            } else if let Some(entry) = self
                .tracked
                .lock()
                .expect("tracked lock")
                .get_mut(&session)
            {
                entry.last_status = current;
            }
        }
    }

    fn handle_terminal_edge(&self, session: &str, worker: &TrackedWorker, status: WorkerStatus) {
        let feature_id = worker.feature_id.as_str();
        info!(feature_id, session = %session, ?status, "Worker reached terminal state");
        let _ = self.engine.stop_monitoring(session);

        if worker.role == WorkerRole::Implementer {
            let mut registry = self.registry.lock().expect("registry lock");
            match status {
                WorkerStatus::Completed => {
                    if let Ok(files) = self.snapshots.modified_files(feature_id) {
                        let _ = registry.set_modified_files(feature_id, files);
                    }
                    let _ = registry.mark_completed(feature_id);
                    drop(registry);
                    match self.snapshots.delete_snapshot_branch(feature_id) {
                        Ok(_) => {}
                        Err(e) => {
                            warn!(feature_id, error = %e, "Failed to delete snapshot branch")
                        }
                    }
                }
                WorkerStatus::Crashed => {
                    let _ = registry.mark_failed(
                        feature_id,
                        "worker session ended without a completion marker",
                    );
                }
                _ => {}
            }
        }

        // Remove before firing callbacks so a re-entrant poll cannot see
        // the worker and fire the edge twice.
        self.tracked.lock().expect("tracked lock").remove(session);

        let event = CompletionEvent {
            feature_id: feature_id.to_string(),
            session_name: session.to_string(),
            status,
            observed_at: Utc::now(),
        };
        let callbacks: Vec<CompletionCallback> = {
            let guard = self.callbacks.lock().expect("callbacks lock");
            guard.clone()
        };
        for callback in callbacks {
            callback(&event);
        }
    }

    /// Block until the feature's worker reaches a terminal state or the
    /// timeout elapses (the configured wait timeout when `None`). The only
    /// blocking helper; everything else polls.
    pub async fn wait_for_completion(
        &self,
        feature_id: &str,
        timeout: Option<std::time::Duration>,
    ) -> WaitOutcome {
        let deadline = Instant::now() + timeout.unwrap_or(self.config.wait_timeout);
        let mut last = WorkerStatus::NotFound;
        loop {
            self.reconcile().await;
            let session = self
                .workspace
                .read_status(feature_id)
                .map(|r| r.session_name);
            if let Some(session) = session {
                last = self.check_worker(&session, 0).await.status;
                match last {
                    WorkerStatus::Completed => return WaitOutcome::Completed,
                    WorkerStatus::Crashed => return WaitOutcome::Crashed,
                    _ => {}
                }
            }
            if Instant::now() >= deadline {
                return WaitOutcome::TimedOut(last);
            }
            tokio::time::sleep(self.config.poll_interval.min(
                deadline.saturating_duration_since(Instant::now()),
            ))
            .await;
        }
    }

    fn session_identity(&self, session_name: &str) -> Option<(WorkerRole, String)> {
        {
            let tracked = self.tracked.lock().expect("tracked lock");
            if let Some(w) = tracked.get(session_name) {
                return Some((w.role, w.feature_id.clone()));
            }
        }
        parse_session_name(session_name)
    }

    fn last_observed(&self, session_name: &str) -> Option<WorkerStatus> {
        self.tracked
            .lock()
            .expect("tracked lock")
            .get(session_name)
            .map(|w| w.last_status)
    }
}

/// Split `{role}-{featureId}-{suffix}` back into role and feature id. The
/// suffix is always 8 hex characters, so the id can itself contain dashes.
fn parse_session_name(session: &str) -> Option<(WorkerRole, String)> {
    let (role_str, rest) = session.split_once('-')?;
    let role = match role_str {
        "worker" => WorkerRole::Implementer,
        "planner" => WorkerRole::Planner,
        "review" => WorkerRole::Reviewer,
        _ => return None,
    };
    let (id, suffix) = rest.rsplit_once('-')?;
    if id.is_empty() || suffix.len() != 8 {
        return None;
    }
    Some((role, id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn test_supervisor(host: Arc<dyn SessionHost>) -> (Arc<WorkerSupervisor>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = SupervisorConfig::new(dir.path().to_path_buf())
            .with_poll_interval(std::time::Duration::from_millis(10));
        // No git repo in the temp dir; snapshots run disabled.
        let snapshots = SnapshotManager::open(dir.path());
        let supervisor = WorkerSupervisor::with_parts(config, host, snapshots).unwrap();
        (Arc::new(supervisor), dir)
    }

    fn feature(id: &str) -> Feature {
        Feature::new(id, "add a widget to the dashboard")
    }

    // ---- Spawn path ----

    #[tokio::test]
    async fn start_worker_creates_session_and_artifacts() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let result = supervisor.start_worker(&feature("f1"), None).await;
        assert!(result.success, "spawn failed: {:?}", result.error);
        let session = result.session_name.expect("session name");
        assert!(session.starts_with("worker-f1-"));

        assert!(supervisor.workspace().prompt_path("f1").exists());
        assert!(supervisor.workspace().log_path("f1").exists());
        assert!(supervisor.workspace().read_status("f1").is_some());
        assert!(host.exists(&session).await.unwrap());

        // Registry moved to in-progress with the session as worker id
        let f = supervisor.feature("f1").unwrap();
        assert_eq!(f.status, FeatureStatus::InProgress);
        assert_eq!(f.worker_id.as_deref(), Some(session.as_str()));
        assert_eq!(f.attempts, 1);
    }

    #[tokio::test]
    async fn invalid_feature_id_is_rejected_without_side_effects() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let result = supervisor.start_worker(&feature("bad id"), None).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("Invalid feature ID"));
        assert!(!supervisor.workspace().prompt_path("bad id").exists());
        assert!(!supervisor.workspace().log_path("bad id").exists());
        assert!(host.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_host_refuses_spawn_before_artifacts() {
        let host = Arc::new(MemorySessionHost::unreachable());
        let (supervisor, _dir) = test_supervisor(host);

        let result = supervisor.start_worker(&feature("f1"), None).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("unavailable"));
        assert!(!supervisor.workspace().prompt_path("f1").exists());
    }

    #[tokio::test]
    async fn double_spawn_is_rejected() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host);

        let f = feature("f1");
        assert!(supervisor.start_worker(&f, None).await.success);
        let second = supervisor.start_worker(&f, None).await;
        assert!(!second.success);
        assert!(second.error.as_deref().unwrap().contains("active worker"));
    }

    #[tokio::test]
    async fn prompt_is_passed_by_file_not_inline() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let secret_prompt = "SECRET-PROMPT-CONTENT do not leak";
        let result = supervisor
            .start_worker(&feature("f1"), Some(secret_prompt))
            .await;
        let session = result.session_name.unwrap();
        let command = host.command_for(&session).unwrap();
        assert!(!command.contains("SECRET-PROMPT-CONTENT"));
        assert!(command.contains("f1.prompt"));

        let on_disk =
            std::fs::read_to_string(supervisor.workspace().prompt_path("f1")).unwrap();
        assert_eq!(on_disk, secret_prompt);
    }

    #[tokio::test]
    async fn review_worker_gets_read_only_tools() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let result = supervisor.start_review_worker(&feature("f1"), None).await;
        let session = result.session_name.unwrap();
        assert!(session.starts_with("review-f1-"));
        let command = host.command_for(&session).unwrap();
        assert!(command.contains("Read,Grep,Glob"));
        assert!(!command.contains("Edit"));
        // Review artifacts are role-suffixed
        assert!(command.contains("f1.review.prompt"));

        // A review spawn does not claim the feature
        let f = supervisor.feature("f1").unwrap();
        assert_eq!(f.status, FeatureStatus::Pending);
    }

    // ---- Polling ----

    #[tokio::test]
    async fn check_worker_reports_running_then_completed() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let session = supervisor
            .start_worker(&feature("f1"), None)
            .await
            .session_name
            .unwrap();
        host.seed_output(&session, "⏺ Read(src/lib.rs)\n");
        let check = supervisor.check_worker(&session, 50).await;
        assert_eq!(check.status, WorkerStatus::Running);
        assert!(check.recent_output.unwrap().contains("Read"));

        // Worker exits cleanly: marker written, session gone
        std::fs::write(supervisor.workspace().done_path("f1"), "done\n").unwrap();
        host.terminate(&session);
        let check = supervisor.check_worker(&session, 50).await;
        assert_eq!(check.status, WorkerStatus::Completed);
    }

    #[tokio::test]
    async fn check_worker_reports_crash_without_marker() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let session = supervisor
            .start_worker(&feature("f1"), None)
            .await
            .session_name
            .unwrap();
        host.terminate(&session);
        let check = supervisor.check_worker(&session, 0).await;
        assert_eq!(check.status, WorkerStatus::Crashed);
    }

    #[tokio::test]
    async fn check_unknown_session_is_not_found() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host);
        let check = supervisor.check_worker("worker-ghost-deadbeef", 0).await;
        assert_eq!(check.status, WorkerStatus::NotFound);
    }

    // ---- Completion reconciliation ----

    #[tokio::test]
    async fn completion_edge_fires_callback_exactly_once() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        supervisor.on_worker_completion(Arc::new(move |event| {
            assert_eq!(event.feature_id, "f1");
            assert_eq!(event.status, WorkerStatus::Completed);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let session = supervisor
            .start_worker(&feature("f1"), None)
            .await
            .session_name
            .unwrap();
        std::fs::write(supervisor.workspace().done_path("f1"), "done\n").unwrap();
        host.terminate(&session);

        supervisor.reconcile().await;
        supervisor.reconcile().await;
        supervisor.reconcile().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let f = supervisor.feature("f1").unwrap();
        assert_eq!(f.status, FeatureStatus::Completed);
        assert!(f.worker_id.is_none());
    }

    #[tokio::test]
    async fn concurrent_review_does_not_mask_implementer_completion() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        supervisor.on_worker_completion(Arc::new(move |event| {
            assert_eq!(event.feature_id, "f1");
            assert_eq!(event.status, WorkerStatus::Completed);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let worker = supervisor
            .start_worker(&feature("f1"), None)
            .await
            .session_name
            .unwrap();
        std::fs::write(
            supervisor.workspace().log_path("f1"),
            "⏺ Edit(src/lib.rs)\n",
        )
        .unwrap();

        let review = supervisor.start_review_worker(&feature("f1"), None).await;
        assert!(review.success, "review spawn failed: {:?}", review.error);
        let review_session = review.session_name.unwrap();

        // The review spawn must not touch the implementer's artifacts
        let log = std::fs::read_to_string(supervisor.workspace().log_path("f1")).unwrap();
        assert!(log.contains("Edit"), "implementer log was truncated");

        // Implementer finishes while the review is still running
        std::fs::write(supervisor.workspace().done_path("f1"), "done\n").unwrap();
        host.terminate(&worker);
        supervisor.reconcile().await;
        supervisor.reconcile().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            supervisor.feature("f1").unwrap().status,
            FeatureStatus::Completed
        );
        // The review session keeps running, untouched by the edge
        assert!(host.exists(&review_session).await.unwrap());
        assert_eq!(
            supervisor.check_worker(&review_session, 0).await.status,
            WorkerStatus::Running
        );
    }

    #[tokio::test]
    async fn crash_edge_marks_feature_failed() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let session = supervisor
            .start_worker(&feature("f1"), None)
            .await
            .session_name
            .unwrap();
        host.terminate(&session);
        supervisor.reconcile().await;

        let f = supervisor.feature("f1").unwrap();
        assert_eq!(f.status, FeatureStatus::Failed);
        assert!(f.last_error.as_deref().unwrap().contains("completion marker"));
    }

    #[tokio::test]
    async fn removed_features_are_pruned_silently() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        supervisor.on_worker_completion(Arc::new(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let session = supervisor
            .start_worker(&feature("f1"), None)
            .await
            .session_name
            .unwrap();
        supervisor.remove_feature("f1");
        host.terminate(&session);
        supervisor.reconcile().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.check_all_workers().await.len(), 0);
    }

    #[tokio::test]
    async fn background_monitor_detects_completion() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let session = supervisor
            .start_worker(&feature("f1"), None)
            .await
            .session_name
            .unwrap();
        supervisor.start_completion_monitor();
        // Starting again while running is a no-op
        supervisor.start_completion_monitor();

        std::fs::write(supervisor.workspace().done_path("f1"), "done\n").unwrap();
        host.terminate(&session);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if supervisor.feature("f1").unwrap().status == FeatureStatus::Completed {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "monitor never observed completion"
            );
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        supervisor.stop_completion_monitor();
    }

    #[tokio::test]
    async fn wait_for_completion_times_out() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host);

        supervisor.start_worker(&feature("f1"), None).await;
        let outcome = supervisor
            .wait_for_completion("f1", Some(std::time::Duration::from_millis(30)))
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut(WorkerStatus::Running));
    }

    #[tokio::test]
    async fn wait_for_completion_sees_crash() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let session = supervisor
            .start_worker(&feature("f1"), None)
            .await
            .session_name
            .unwrap();
        host.terminate(&session);
        let outcome = supervisor
            .wait_for_completion("f1", Some(std::time::Duration::from_secs(5)))
            .await;
        assert_eq!(outcome, WaitOutcome::Crashed);
    }

    // ---- Kill ----

    #[tokio::test]
    async fn kill_worker_is_best_effort_and_marks_failed() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let session = supervisor
            .start_worker(&feature("f1"), None)
            .await
            .session_name
            .unwrap();
        supervisor.kill_worker("f1").await;
        assert!(!host.exists(&session).await.unwrap());
        assert_eq!(supervisor.feature("f1").unwrap().status, FeatureStatus::Failed);

        // Killing an unknown feature is a no-op
        supervisor.kill_worker("ghost").await;
    }

    // ---- Heartbeat ----

    #[tokio::test]
    async fn heartbeat_merges_health_while_running() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        supervisor.start_worker(&feature("f1"), None).await;
        std::fs::write(
            supervisor.workspace().log_path("f1"),
            "⏺ Read(src/lib.rs)\n⏺ Edit(src/lib.rs)\n",
        )
        .unwrap();

        let hb = supervisor.get_heartbeat_info("f1").await;
        assert_eq!(hb.last_tool.as_deref(), Some("Edit"));
        assert_eq!(hb.recent_files, vec!["src/lib.rs"]);
        assert!(hb.elapsed_seconds.is_some());
        assert!(hb.confidence.is_some());
    }

    #[tokio::test]
    async fn heartbeat_omits_health_after_exit() {
        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host.clone());

        let session = supervisor
            .start_worker(&feature("f1"), None)
            .await
            .session_name
            .unwrap();
        host.terminate(&session);
        let hb = supervisor.get_heartbeat_info("f1").await;
        assert!(hb.confidence.is_none());
    }

    // ---- State store ----

    #[tokio::test]
    async fn features_round_trip_through_a_state_store() {
        struct MemoryStore(Mutex<Vec<Feature>>);
        impl crate::registry::StateStore for MemoryStore {
            fn load(&self) -> anyhow::Result<Vec<Feature>> {
                Ok(self.0.lock().unwrap().clone())
            }
            fn save(&self, features: &[Feature]) -> anyhow::Result<()> {
                *self.0.lock().unwrap() = features.to_vec();
                Ok(())
            }
        }

        let host = Arc::new(MemorySessionHost::new());
        let (supervisor, _dir) = test_supervisor(host);
        supervisor.register_feature(feature("f1"));
        supervisor.register_feature(feature("f2"));

        let store = MemoryStore(Mutex::new(Vec::new()));
        supervisor.persist_features(&store).unwrap();

        supervisor.remove_feature("f1");
        supervisor.remove_feature("f2");
        assert!(supervisor.features().is_empty());

        let loaded = supervisor.load_features(&store).unwrap();
        assert_eq!(loaded, 2);
        assert!(supervisor.feature("f1").is_some());
        assert!(supervisor.feature("f2").is_some());
    }

    // ---- Session name parsing ----

    #[test]
    fn session_names_round_trip_dashed_ids() {
        let (role, id) = parse_session_name("worker-my-dashed-id-a1b2c3d4").unwrap();
        assert_eq!(role, WorkerRole::Implementer);
        assert_eq!(id, "my-dashed-id");
        assert!(parse_session_name("unknown-f1-a1b2c3d4").is_none());
        assert!(parse_session_name("worker-f1").is_none());
    }
}
