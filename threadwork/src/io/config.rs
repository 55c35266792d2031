//! Engine configuration stored as TOML (default `threadwork.toml`).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::tools::ToolKind;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values suitable for a single local repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding thread records and default worktrees.
    pub data_dir: PathBuf,

    /// Model calls allowed per turn before the thread fails.
    pub max_steps: u32,

    /// Estimated-token budget for the view sent to the model.
    pub context_budget_tokens: usize,

    /// Tool results larger than this are previewed when the view is reduced.
    pub tool_preview_bytes: usize,

    /// Default timeout for `run_command`.
    pub exec_timeout_secs: u64,

    /// Per-stream cap on captured command output.
    pub exec_output_limit_bytes: usize,

    pub generation: GenerationConfig,

    pub sandbox: SandboxConfig,

    pub domains: Vec<DomainConfig>,

    /// Enabled tool names; an empty list enables nothing.
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GenerationConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Base delay of the exponential backoff.
    pub backoff_ms: u64,
    /// Limit for side requests such as merge summaries and titles.
    pub side_request_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 500,
            side_request_timeout_secs: 30,
        }
    }
}

impl GenerationConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn side_request_timeout(&self) -> Duration {
        Duration::from_secs(self.side_request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// When false, every thread runs unsandboxed.
    pub enabled: bool,
    /// Container CLI binary (e.g. `docker` or `podman`).
    pub runtime: String,
    pub image: String,
    /// Mount point of the worktree inside the container.
    pub mount_path: String,
    /// How long in-flight tool calls may finish after cancellation.
    pub cancel_grace_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            runtime: "docker".to_string(),
            image: "debian:bookworm-slim".to_string(),
            mount_path: "/workspace".to_string(),
            cancel_grace_secs: 5,
        }
    }
}

/// A git repository threads can work against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Where thread worktrees are created; defaults to `<data_dir>/worktrees/<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_root: Option<PathBuf>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl DomainConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            default_branch: default_branch(),
            worktree_root: None,
        }
    }

    pub fn resolved_worktree_root(&self, data_dir: &Path) -> PathBuf {
        self.worktree_root
            .clone()
            .unwrap_or_else(|| data_dir.join("worktrees").join(&self.name))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".threadwork"),
            max_steps: 25,
            context_budget_tokens: 100_000,
            tool_preview_bytes: 2_000,
            exec_timeout_secs: 120,
            exec_output_limit_bytes: 100_000,
            generation: GenerationConfig::default(),
            sandbox: SandboxConfig::default(),
            domains: Vec::new(),
            tools: ToolKind::ALL
                .iter()
                .map(|kind| kind.name().to_string())
                .collect(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.context_budget_tokens == 0 {
            return Err(anyhow!("context_budget_tokens must be > 0"));
        }
        if self.tool_preview_bytes == 0 {
            return Err(anyhow!("tool_preview_bytes must be > 0"));
        }
        if self.exec_timeout_secs == 0 {
            return Err(anyhow!("exec_timeout_secs must be > 0"));
        }
        if self.exec_output_limit_bytes == 0 {
            return Err(anyhow!("exec_output_limit_bytes must be > 0"));
        }
        if self.generation.side_request_timeout_secs == 0 {
            return Err(anyhow!("generation.side_request_timeout_secs must be > 0"));
        }
        if self.sandbox.enabled {
            if self.sandbox.runtime.trim().is_empty() {
                return Err(anyhow!("sandbox.runtime must be non-empty"));
            }
            if self.sandbox.image.trim().is_empty() {
                return Err(anyhow!("sandbox.image must be non-empty"));
            }
            if !self.sandbox.mount_path.starts_with('/') {
                return Err(anyhow!("sandbox.mount_path must be absolute"));
            }
        }

        let mut names = HashSet::new();
        for domain in &self.domains {
            if domain.name.trim().is_empty() {
                return Err(anyhow!("domain name must be non-empty"));
            }
            if !names.insert(domain.name.as_str()) {
                return Err(anyhow!("duplicate domain '{}'", domain.name));
            }
            if domain.default_branch.trim().is_empty() {
                return Err(anyhow!(
                    "domain '{}' default_branch must be non-empty",
                    domain.name
                ));
            }
        }

        for tool in &self.tools {
            if ToolKind::from_name(tool).is_none() {
                return Err(anyhow!("unknown tool '{tool}' in tools"));
            }
        }
        Ok(())
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.sandbox.cancel_grace_secs)
    }

    pub fn domain(&self, name: &str) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| d.name == name)
    }

    pub fn threads_dir(&self) -> PathBuf {
        self.data_dir.join("threads")
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

/// Write `contents` next to `path` and rename over it.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
