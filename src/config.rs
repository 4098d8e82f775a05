//! Runtime configuration for the supervisor.
//!
//! Defaults are usable out of the box; a `.shepherd/config.toml` in the
//! project directory overrides them. Builder methods cover the settings
//! callers most often flip programmatically.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default interval for the completion reconciliation loop.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
/// Default deadline for the blocking wait helper (30 minutes).
const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 1800;
/// Default agent CLI command.
const DEFAULT_AGENT_CMD: &str = "claude";

fn default_allowed_tools() -> Vec<String> {
    ["Read", "Edit", "Write", "Bash", "Grep", "Glob"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Repository the workers operate on.
    pub project_dir: PathBuf,
    /// Where per-feature artifacts (prompt/log/status/...) live.
    pub workspace_dir: PathBuf,
    /// Agent CLI command (default: "claude").
    pub agent_cmd: String,
    /// Explicit tool allow-list granted to every spawned worker.
    pub allowed_tools: Vec<String>,
    /// Completion monitor tick interval.
    pub poll_interval: Duration,
    /// Deadline for `wait_for_completion`.
    pub wait_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(project_dir: PathBuf) -> Self {
        let workspace_dir = project_dir.join(".shepherd");
        Self {
            project_dir,
            workspace_dir,
            agent_cmd: DEFAULT_AGENT_CMD.to_string(),
            allowed_tools: default_allowed_tools(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            wait_timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
        }
    }

    /// Load, applying `.shepherd/config.toml` overrides when present.
    pub fn load(project_dir: PathBuf) -> Result<Self> {
        let mut config = Self::new(project_dir);
        let file = config.workspace_dir.join("config.toml");
        if file.exists() {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let parsed: FileConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            config.apply(parsed.supervisor.unwrap_or_default());
        }
        Ok(config)
    }

    fn apply(&mut self, section: SupervisorSection) {
        if let Some(cmd) = section.agent_cmd {
            self.agent_cmd = cmd;
        }
        if let Some(tools) = section.allowed_tools {
            self.allowed_tools = tools;
        }
        if let Some(secs) = section.poll_interval_secs {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = section.wait_timeout_secs {
            self.wait_timeout = Duration::from_secs(secs);
        }
    }

    pub fn with_agent_cmd(mut self, cmd: &str) -> Self {
        self.agent_cmd = cmd.to_string();
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_workspace_dir(mut self, dir: &Path) -> Self {
        self.workspace_dir = dir.to_path_buf();
        self
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.workspace_dir)
            .context("Failed to create workspace directory")?;
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    supervisor: Option<SupervisorSection>,
}

#[derive(Debug, Default, Deserialize)]
struct SupervisorSection {
    agent_cmd: Option<String>,
    allowed_tools: Option<Vec<String>>,
    poll_interval_secs: Option<u64>,
    wait_timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_sane() {
        let config = SupervisorConfig::new(PathBuf::from("/project"));
        assert_eq!(config.agent_cmd, "claude");
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.workspace_dir, PathBuf::from("/project/.shepherd"));
        assert!(config.allowed_tools.contains(&"Read".to_string()));
    }

    #[test]
    fn builder_overrides() {
        let config = SupervisorConfig::new(PathBuf::from("/project"))
            .with_agent_cmd("my-agent")
            .with_poll_interval(Duration::from_secs(1))
            .with_wait_timeout(Duration::from_secs(5))
            .with_allowed_tools(vec!["Read".to_string()]);
        assert_eq!(config.agent_cmd, "my-agent");
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.wait_timeout, Duration::from_secs(5));
        assert_eq!(config.allowed_tools, vec!["Read"]);
    }

    #[test]
    fn load_applies_toml_overrides() {
        let dir = tempdir().unwrap();
        let workspace = dir.path().join(".shepherd");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(
            workspace.join("config.toml"),
            r#"
[supervisor]
agent_cmd = "custom-agent"
poll_interval_secs = 3
allowed_tools = ["Read", "Grep"]
"#,
        )
        .unwrap();

        let config = SupervisorConfig::load(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.agent_cmd, "custom-agent");
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.allowed_tools, vec!["Read", "Grep"]);
        // Untouched settings keep their defaults
        assert_eq!(config.wait_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = SupervisorConfig::load(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.agent_cmd, "claude");
    }
}
