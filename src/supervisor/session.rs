//! Session host port and the tmux-backed default implementation.
//!
//! Workers run inside detached terminal sessions so they survive the
//! supervisor process and can be inspected interactively. The trait keeps
//! the supervisor testable without a terminal multiplexer installed; the
//! in-memory host doubles as a dry-run backend.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tokio::process::Command;

/// Abstraction over the process host that carries worker sessions.
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// Create a detached session running `command` in `working_dir`.
    async fn create(&self, session: &str, working_dir: &Path, command: &str) -> Result<()>;

    /// List the names of all live sessions.
    async fn list(&self) -> Result<Vec<String>>;

    async fn exists(&self, session: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|s| s == session))
    }

    /// Capture the last `lines` lines of visible output from a session.
    async fn capture_output(&self, session: &str, lines: usize) -> Result<String>;

    /// Kill a session. Killing a session that is already gone is not an
    /// error.
    async fn kill(&self, session: &str) -> Result<()>;
}

/// Tmux-backed session host.
pub struct TmuxSessionHost {
    tmux_cmd: String,
}

impl TmuxSessionHost {
    pub fn new() -> Self {
        Self {
            tmux_cmd: "tmux".to_string(),
        }
    }

    pub fn with_command(tmux_cmd: &str) -> Self {
        Self {
            tmux_cmd: tmux_cmd.to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.tmux_cmd)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run {} {}", self.tmux_cmd, args.join(" ")))
    }
}

impl Default for TmuxSessionHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionHost for TmuxSessionHost {
    async fn create(&self, session: &str, working_dir: &Path, command: &str) -> Result<()> {
        let dir = working_dir.to_string_lossy();
        let output = self
            .run(&["new-session", "-d", "-s", session, "-c", &dir, command])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "tmux failed to create session {}: {}",
                session,
                stderr.trim()
            ));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let output = self
            .run(&["list-sessions", "-F", "#{session_name}"])
            .await?;
        // tmux exits non-zero when no server is running; that just means
        // no sessions.
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn capture_output(&self, session: &str, lines: usize) -> Result<String> {
        let start = format!("-{}", lines);
        let output = self
            .run(&["capture-pane", "-p", "-t", session, "-S", &start])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "tmux failed to capture pane for {}: {}",
                session,
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn kill(&self, session: &str) -> Result<()> {
        // Best effort: an already-dead session returns non-zero, which we
        // treat as success.
        let _ = self.run(&["kill-session", "-t", session]).await?;
        Ok(())
    }
}

/// In-memory session host for tests and dry runs. Sessions exist until
/// killed; captured output is whatever the test seeded.
#[derive(Default)]
pub struct MemorySessionHost {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    sessions: Vec<String>,
    output: HashMap<String, String>,
    commands: HashMap<String, String>,
    fail_create: bool,
    fail_list: bool,
}

impl MemorySessionHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `list` fail, simulating an unreachable host.
    pub fn unreachable() -> Self {
        let host = Self::default();
        {
            let mut state = host.state.lock().expect("session host lock");
            state.fail_list = true;
            state.fail_create = true;
        }
        host
    }

    pub fn seed_output(&self, session: &str, output: &str) {
        self.state
            .lock()
            .expect("session host lock")
            .output
            .insert(session.to_string(), output.to_string());
    }

    /// End a session without going through the supervisor, as if the
    /// worker process exited.
    pub fn terminate(&self, session: &str) {
        self.state
            .lock()
            .expect("session host lock")
            .sessions
            .retain(|s| s != session);
    }

    pub fn command_for(&self, session: &str) -> Option<String> {
        self.state
            .lock()
            .expect("session host lock")
            .commands
            .get(session)
            .cloned()
    }
}

#[async_trait]
impl SessionHost for MemorySessionHost {
    async fn create(&self, session: &str, _working_dir: &Path, command: &str) -> Result<()> {
        let mut state = self.state.lock().expect("session host lock");
        if state.fail_create {
            return Err(anyhow!("session host is unavailable"));
        }
        state.sessions.push(session.to_string());
        state
            .commands
            .insert(session.to_string(), command.to_string());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let state = self.state.lock().expect("session host lock");
        if state.fail_list {
            return Err(anyhow!("session host is unreachable"));
        }
        Ok(state.sessions.clone())
    }

    async fn capture_output(&self, session: &str, _lines: usize) -> Result<String> {
        let state = self.state.lock().expect("session host lock");
        state
            .output
            .get(session)
            .cloned()
            .ok_or_else(|| anyhow!("no such session: {}", session))
    }

    async fn kill(&self, session: &str) -> Result<()> {
        self.state
            .lock()
            .expect("session host lock")
            .sessions
            .retain(|s| s != session);
        Ok(())
    }
}

/// Builds the non-interactive agent command line for a worker session.
///
/// The prompt is always passed by redirecting the prompt file into stdin;
/// its content never appears in the shell string. The completion marker is
/// only written when the agent exits cleanly, so a crashed worker leaves
/// no marker behind.
pub struct AgentLauncher {
    agent_cmd: String,
}

impl AgentLauncher {
    pub fn new(agent_cmd: &str) -> Self {
        Self {
            agent_cmd: agent_cmd.to_string(),
        }
    }

    pub fn build_command(
        &self,
        prompt_file: &Path,
        log_file: &Path,
        done_file: &Path,
        allowed_tools: &[String],
    ) -> String {
        let tools = allowed_tools.join(",");
        format!(
            "{} --print --dangerously-skip-permissions --allowed-tools {} < {} >> {} 2>&1 && date -u +%Y-%m-%dT%H:%M:%SZ > {}",
            self.agent_cmd,
            shell_quote(&tools),
            shell_quote(&prompt_file.to_string_lossy()),
            shell_quote(&log_file.to_string_lossy()),
            shell_quote(&done_file.to_string_lossy()),
        )
    }
}

/// Single-quote a string for POSIX shells.
fn shell_quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "._-/,".contains(c)) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
