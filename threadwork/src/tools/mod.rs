//! The closed tool set offered to the model.
//!
//! Every tool is a [`ToolKind`] variant with a JSON schema, a description and
//! a [`Requirement`] saying what it needs from the thread (a worktree, an
//! execution environment, or nothing). The [`ToolRegistry`] is built once at
//! startup from the enabled tool names and owns the compiled schemas.

mod dispatch;
mod fs;

pub use dispatch::{ExecTarget, ToolContext};

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use serde_json::{Value, json};

use crate::io::model::ToolDeclaration;

/// Maximum hits returned by `search_files`.
pub const MAX_SEARCH_HITS: usize = 200;

/// Default page size of `read_tool_output`.
pub const DEFAULT_PAGE_BYTES: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    ReadFile,
    WriteFile,
    ListDirectory,
    SearchFiles,
    RunCommand,
    ReadToolOutput,
    CurrentTime,
}

/// What a tool needs before it can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Filesystem,
    Execution,
    Pure,
}

impl Requirement {
    /// Needs the thread's worktree (and sandbox, when enabled).
    pub fn needs_workspace(self) -> bool {
        !matches!(self, Requirement::Pure)
    }
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        ToolKind::ReadFile,
        ToolKind::WriteFile,
        ToolKind::ListDirectory,
        ToolKind::SearchFiles,
        ToolKind::RunCommand,
        ToolKind::ReadToolOutput,
        ToolKind::CurrentTime,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::ReadFile => "read_file",
            ToolKind::WriteFile => "write_file",
            ToolKind::ListDirectory => "list_directory",
            ToolKind::SearchFiles => "search_files",
            ToolKind::RunCommand => "run_command",
            ToolKind::ReadToolOutput => "read_tool_output",
            ToolKind::CurrentTime => "current_time",
        }
    }

    /// Look up a tool by (sanitized) name.
    pub fn from_name(name: &str) -> Option<ToolKind> {
        let name = sanitize_tool_name(name);
        ToolKind::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn requirement(self) -> Requirement {
        match self {
            ToolKind::ReadFile
            | ToolKind::WriteFile
            | ToolKind::ListDirectory
            | ToolKind::SearchFiles => Requirement::Filesystem,
            ToolKind::RunCommand => Requirement::Execution,
            ToolKind::ReadToolOutput | ToolKind::CurrentTime => Requirement::Pure,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::ReadFile => {
                "Read a text file. `offset` is the first line (0-based) and `limit` the number of lines."
            }
            ToolKind::WriteFile => {
                "Write `content` to a file, creating parent directories. Set `append` to add to the end instead of replacing."
            }
            ToolKind::ListDirectory => {
                "List a directory (default: repository root). Directories end with `/`."
            }
            ToolKind::SearchFiles => {
                "Search file contents with a regular expression. Returns `path:line: text` hits."
            }
            ToolKind::RunCommand => {
                "Run a shell command in the repository root and return its exit code and output."
            }
            ToolKind::ReadToolOutput => {
                "Page through the full output of an earlier tool call by its correlation id. `offset` and `limit` are in bytes."
            }
            ToolKind::CurrentTime => "Current date and time in UTC (RFC 3339).",
        }
    }

    pub fn schema(self) -> Value {
        match self {
            ToolKind::ReadFile => json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "minLength": 1 },
                    "offset": { "type": "integer", "minimum": 0 },
                    "limit": { "type": "integer", "minimum": 1 }
                },
                "required": ["path"],
                "additionalProperties": false
            }),
            ToolKind::WriteFile => json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "minLength": 1 },
                    "content": { "type": "string" },
                    "append": { "type": "boolean" }
                },
                "required": ["path", "content"],
                "additionalProperties": false
            }),
            ToolKind::ListDirectory => json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" }
                },
                "additionalProperties": false
            }),
            ToolKind::SearchFiles => json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "minLength": 1 },
                    "path": { "type": "string" }
                },
                "required": ["pattern"],
                "additionalProperties": false
            }),
            ToolKind::RunCommand => json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "minLength": 1 },
                    "timeout_secs": { "type": "integer", "minimum": 1, "maximum": 3600 }
                },
                "required": ["command"],
                "additionalProperties": false
            }),
            ToolKind::ReadToolOutput => json!({
                "type": "object",
                "properties": {
                    "correlation_id": { "type": "string", "minLength": 1 },
                    "offset": { "type": "integer", "minimum": 0 },
                    "limit": { "type": "integer", "minimum": 1 }
                },
                "required": ["correlation_id"],
                "additionalProperties": false
            }),
            ToolKind::CurrentTime => json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        }
    }
}

/// Normalize a model-provided tool name: trim, lowercase, `-`/space to `_`.
pub fn sanitize_tool_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

struct RegisteredTool {
    kind: ToolKind,
    validator: Validator,
}

/// Enabled tools with their compiled argument schemas.
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tools.iter().map(|t| t.kind.name()))
            .finish()
    }
}

impl ToolRegistry {
    pub fn new(enabled: &[ToolKind]) -> Result<Self> {
        let mut tools: Vec<RegisteredTool> = Vec::with_capacity(enabled.len());
        for &kind in enabled {
            if tools.iter().any(|t| t.kind == kind) {
                continue;
            }
            let validator = jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&kind.schema())
                .with_context(|| format!("compile schema for {}", kind.name()))?;
            tools.push(RegisteredTool { kind, validator });
        }
        Ok(Self { tools })
    }

    /// Build from configured names.
    pub fn from_names(names: &[String]) -> Result<Self> {
        let kinds = names
            .iter()
            .map(|name| ToolKind::from_name(name).ok_or_else(|| anyhow!("unknown tool '{name}'")))
            .collect::<Result<Vec<_>>>()?;
        Self::new(&kinds)
    }

    pub fn kinds(&self) -> Vec<ToolKind> {
        self.tools.iter().map(|t| t.kind).collect()
    }

    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools
            .iter()
            .map(|t| ToolDeclaration {
                name: t.kind.name().to_string(),
                description: t.kind.description().to_string(),
                parameters: t.kind.schema(),
            })
            .collect()
    }

    /// Enabled tool for a raw model-provided name.
    pub fn resolve(&self, raw_name: &str) -> Option<ToolKind> {
        let kind = ToolKind::from_name(raw_name)?;
        self.tools.iter().any(|t| t.kind == kind).then_some(kind)
    }

    /// Schema violations for `arguments`, empty when valid.
    pub fn validate(&self, kind: ToolKind, arguments: &Value) -> Vec<String> {
        let Some(tool) = self.tools.iter().find(|t| t.kind == kind) else {
            return vec![format!("tool {} is not enabled", kind.name())];
        };
        tool.validator
            .iter_errors(arguments)
            .map(|err| err.to_string())
            .collect()
    }
}
