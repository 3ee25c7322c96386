//! Persistence for tuning (config) and runtime state.
//!
//! - **Config** (`config.json`): poll intervals, timer delays, display limits,
//!   saved to the platform config directory.
//! - **State** (`state.json`): known transcripts and tracked agents, saved to
//!   the platform data directory.
//!
//! On Linux these resolve to `~/.config/agentwatch/` and `~/.local/share/agentwatch/`.

use crate::event::AgentId;
use crate::tool_status::DisplayLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Tuning knobs (persisted to config.json). Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Poll interval while waiting for a transcript to be created.
    pub await_file_poll_ms: u64,
    /// Fallback poll interval once a transcript is being tailed.
    pub file_poll_ms: u64,
    /// Interval between project directory scans.
    pub project_scan_ms: u64,
    /// Change notifications closer together than this are coalesced.
    pub change_debounce_ms: u64,
    /// Delay before "tool done" events are published.
    pub tool_done_delay_ms: u64,
    /// How long a non-exempt tool may stay open before a permission notice.
    pub permission_delay_ms: u64,
    /// How long text-only output must sit before the agent counts as waiting.
    pub text_idle_delay_ms: u64,
    pub bash_command_max: usize,
    pub task_description_max: usize,
    /// Tools that never trigger a permission notice on their own.
    pub permission_exempt_tools: Vec<String>,
    /// Capacity of the outward event channel.
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        let limits = DisplayLimits::default();
        Self {
            await_file_poll_ms: 1000,
            file_poll_ms: 2000,
            project_scan_ms: 1000,
            change_debounce_ms: 50,
            tool_done_delay_ms: 300,
            permission_delay_ms: 7000,
            text_idle_delay_ms: 5000,
            bash_command_max: limits.bash_command_max,
            task_description_max: limits.task_description_max,
            permission_exempt_tools: vec!["Task".to_string(), "AskUserQuestion".to_string()],
            event_buffer: 4096,
        }
    }
}

impl Config {
    pub fn await_file_poll(&self) -> Duration {
        Duration::from_millis(self.await_file_poll_ms)
    }

    pub fn file_poll(&self) -> Duration {
        Duration::from_millis(self.file_poll_ms)
    }

    pub fn project_scan(&self) -> Duration {
        Duration::from_millis(self.project_scan_ms)
    }

    pub fn change_debounce(&self) -> Duration {
        Duration::from_millis(self.change_debounce_ms)
    }

    pub fn tool_done_delay(&self) -> Duration {
        Duration::from_millis(self.tool_done_delay_ms)
    }

    pub fn permission_delay(&self) -> Duration {
        Duration::from_millis(self.permission_delay_ms)
    }

    pub fn text_idle_delay(&self) -> Duration {
        Duration::from_millis(self.text_idle_delay_ms)
    }

    pub fn display_limits(&self) -> DisplayLimits {
        DisplayLimits {
            bash_command_max: self.bash_command_max,
            task_description_max: self.task_description_max,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// A tracked agent as written to state.json.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedAgent {
    pub id: AgentId,
    pub log_path: PathBuf,
    #[serde(default)]
    pub project_dir: Option<PathBuf>,
}

/// Runtime state (persisted to state.json).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Transcripts already seen by a project scan.
    #[serde(default)]
    pub known_files: Vec<PathBuf>,
    #[serde(default)]
    pub agents: Vec<PersistedAgent>,
}

// ---------------------------------------------------------------------------
// Directory helpers
// ---------------------------------------------------------------------------

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("agentwatch"))
}

fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("agentwatch"))
}

/// Default location of config.json.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.json"))
}

/// Default location of state.json.
pub fn state_path() -> Option<PathBuf> {
    data_dir().map(|d| d.join("state.json"))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the platform directory, returning defaults if the file is missing or invalid.
pub fn load_config() -> Config {
    config_path()
        .map(|p| load_config_from(&p))
        .unwrap_or_default()
}

pub fn load_config_from(path: &Path) -> Config {
    load_json_or_default(path)
}

/// Load state from the platform directory, returning defaults if the file is missing or invalid.
pub fn load_state() -> State {
    state_path()
        .map(|p| load_state_from(&p))
        .unwrap_or_default()
}

pub fn load_state_from(path: &Path) -> State {
    load_json_or_default(path)
}

pub fn save_state_to(state: &State, path: &Path) -> Result<(), std::io::Error> {
    save_json(state, path)
}

fn load_json_or_default<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => T::default(),
    }
}

fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Write bytes to a file atomically: write to a temp file in the same
/// directory, then rename over the target. Prevents partial JSON on crash.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
