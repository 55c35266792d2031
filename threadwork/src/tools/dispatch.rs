//! Routing of validated tool calls to the sandbox or the host worktree.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::fs::{self, relative_path, select_lines};
use super::{DEFAULT_PAGE_BYTES, MAX_SEARCH_HITS, ToolKind, ToolRegistry};
use crate::core::context::{Transcript, floor_char_boundary};
use crate::core::sanitize::repair_arguments;
use crate::core::types::{ToolCall, ToolErrorKind, ToolResult};
use crate::io::process::{ExecResult, ExitStatus, run_command_with_timeout, shell_command};
use crate::sandbox::{ExecRequest, SandboxHandle, SandboxManager};

/// Byte cap on the line listing a sandboxed search filters.
const SEARCH_SCAN_LIMIT_BYTES: usize = 16 * 1024 * 1024;

/// Where filesystem and execution tools run for one turn.
#[derive(Clone)]
pub enum ExecTarget {
    /// Inside the thread's container, with the worktree at `handle.workspace`.
    Sandbox {
        manager: Arc<SandboxManager>,
        handle: SandboxHandle,
    },
    /// Directly in the worktree on the host.
    Host { root: PathBuf },
    /// No worktree is open; only pure tools can run.
    Detached,
}

impl std::fmt::Debug for ExecTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecTarget::Sandbox { handle, .. } => {
                f.debug_tuple("Sandbox").field(&handle.id).finish()
            }
            ExecTarget::Host { root } => f.debug_tuple("Host").field(root).finish(),
            ExecTarget::Detached => f.write_str("Detached"),
        }
    }
}

/// Everything a tool call may touch.
#[derive(Debug)]
pub struct ToolContext<'a> {
    pub target: ExecTarget,
    /// Thread log as of the start of the turn.
    pub transcript: &'a Transcript,
    pub exec_timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Deserialize)]
struct ReadFileArgs {
    path: String,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
    #[serde(default)]
    append: bool,
}

#[derive(Deserialize)]
struct ListDirectoryArgs {
    #[serde(default)]
    path: String,
}

#[derive(Deserialize)]
struct SearchFilesArgs {
    pattern: String,
    #[serde(default)]
    path: String,
}

#[derive(Deserialize)]
struct RunCommandArgs {
    command: String,
    timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
struct ReadToolOutputArgs {
    correlation_id: String,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

impl ToolRegistry {
    /// Execute one call. Never fails: every problem becomes an error result.
    #[instrument(skip_all, fields(tool = %call.name, call = %call.id))]
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext<'_>) -> ToolResult {
        let Some(kind) = self.resolve(&call.name) else {
            warn!("unknown tool requested");
            return ToolResult::error(
                &call.id,
                ToolErrorKind::UnknownTool,
                format!("unknown tool '{}'", call.name),
            );
        };

        let repaired = repair_arguments(&call.arguments);
        if repaired.is_some() {
            warn!("repaired malformed tool arguments");
        }
        let arguments = repaired.as_ref().unwrap_or(&call.arguments);

        let violations = self.validate(kind, arguments);
        if !violations.is_empty() {
            debug!(violations = violations.len(), "invalid tool arguments");
            return ToolResult::error(
                &call.id,
                ToolErrorKind::InvalidArguments,
                format!("invalid arguments for {}: {}", kind.name(), violations.join("; ")),
            );
        }

        match run_tool(kind, arguments, ctx).await {
            Ok(output) => ToolResult::ok(&call.id, output),
            Err(err) => {
                debug!(err = %err, "tool execution failed");
                ToolResult::error(&call.id, ToolErrorKind::ExecutionFailed, format!("{err:#}"))
            }
        }
    }
}

fn parse<T: DeserializeOwned>(arguments: &Value) -> Result<T> {
    serde_json::from_value(arguments.clone()).context("decode arguments")
}

async fn run_tool(kind: ToolKind, arguments: &Value, ctx: &ToolContext<'_>) -> Result<String> {
    match kind {
        ToolKind::CurrentTime => Ok(chrono::Utc::now().to_rfc3339()),
        ToolKind::ReadToolOutput => read_tool_output(parse(arguments)?, ctx.transcript),
        ToolKind::RunCommand => run_command(parse(arguments)?, ctx).await,
        ToolKind::ReadFile => {
            let args: ReadFileArgs = parse(arguments)?;
            match &ctx.target {
                ExecTarget::Host { root } => {
                    let root = root.clone();
                    blocking(move || fs::read_file(&root, &args.path, args.offset, args.limit))
                        .await
                }
                ExecTarget::Sandbox { manager, handle } => {
                    let rel = sandbox_path(handle, &args.path)?;
                    let result =
                        sandbox_script(manager, handle, ctx, r#"cat -- "$1""#, &rel, None).await?;
                    let text = checked_stdout(result, &args.path)?;
                    Ok(select_lines(&text, args.offset, args.limit))
                }
                ExecTarget::Detached => Err(detached()),
            }
        }
        ToolKind::WriteFile => {
            let args: WriteFileArgs = parse(arguments)?;
            match &ctx.target {
                ExecTarget::Host { root } => {
                    let root = root.clone();
                    blocking(move || fs::write_file(&root, &args.path, &args.content, args.append))
                        .await
                }
                ExecTarget::Sandbox { manager, handle } => {
                    let rel = sandbox_path(handle, &args.path)?;
                    let script = if args.append {
                        r#"mkdir -p -- "$(dirname -- "$1")" && cat >> "$1""#
                    } else {
                        r#"mkdir -p -- "$(dirname -- "$1")" && cat > "$1""#
                    };
                    let result = sandbox_script(
                        manager,
                        handle,
                        ctx,
                        script,
                        &rel,
                        Some(args.content.as_bytes().to_vec()),
                    )
                    .await?;
                    checked_stdout(result, &args.path)?;
                    let verb = if args.append { "appended" } else { "wrote" };
                    Ok(format!("{verb} {} bytes to {}", args.content.len(), args.path))
                }
                ExecTarget::Detached => Err(detached()),
            }
        }
        ToolKind::ListDirectory => {
            let args: ListDirectoryArgs = parse(arguments)?;
            match &ctx.target {
                ExecTarget::Host { root } => {
                    let root = root.clone();
                    blocking(move || fs::list_directory(&root, &args.path)).await
                }
                ExecTarget::Sandbox { manager, handle } => {
                    let rel = sandbox_path(handle, &args.path)?;
                    let result =
                        sandbox_script(manager, handle, ctx, r#"ls -1Ap -- "$1""#, &rel, None)
                            .await?;
                    let listing = checked_stdout(result, &args.path)?;
                    let names: Vec<&str> = listing
                        .lines()
                        .filter(|name| !name.is_empty() && *name != ".git/")
                        .collect();
                    if names.is_empty() {
                        return Ok(format!("{rel} is empty"));
                    }
                    Ok(names.join("\n"))
                }
                ExecTarget::Detached => Err(detached()),
            }
        }
        ToolKind::SearchFiles => {
            let args: SearchFilesArgs = parse(arguments)?;
            match &ctx.target {
                ExecTarget::Host { root } => {
                    let root = root.clone();
                    blocking(move || fs::search_files(&root, &args.pattern, &args.path)).await
                }
                ExecTarget::Sandbox { manager, handle } => {
                    let regex = Regex::new(&args.pattern)
                        .with_context(|| format!("invalid pattern {:?}", args.pattern))?;
                    let rel = sandbox_path(handle, &args.path)?;
                    // grep only enumerates text lines; matching stays on the
                    // host so both targets accept the same pattern syntax.
                    let request = ExecRequest {
                        argv: vec![
                            "sh".to_string(),
                            "-c".to_string(),
                            r#"grep -rnHI --exclude-dir=.git -e '' -- "$1""#.to_string(),
                            "sh".to_string(),
                            rel,
                        ],
                        stdin: None,
                        timeout: ctx.exec_timeout,
                        output_limit_bytes: SEARCH_SCAN_LIMIT_BYTES,
                    };
                    let result = manager.exec(handle, &request).await?;
                    filter_scan(result, &regex, &args.pattern)
                }
                ExecTarget::Detached => Err(detached()),
            }
        }
    }
}

async fn run_command(args: RunCommandArgs, ctx: &ToolContext<'_>) -> Result<String> {
    let timeout = args
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(ctx.exec_timeout);
    let result = match &ctx.target {
        ExecTarget::Sandbox { manager, handle } => {
            let request = ExecRequest::shell(&args.command, timeout, ctx.output_limit_bytes);
            manager.exec(handle, &request).await?
        }
        ExecTarget::Host { root } => {
            let mut cmd = shell_command(&args.command);
            cmd.current_dir(root);
            run_command_with_timeout(cmd, None, timeout, ctx.output_limit_bytes)
                .await?
                .into_exec_result()
        }
        ExecTarget::Detached => return Err(detached()),
    };
    Ok(result.render())
}

fn read_tool_output(args: ReadToolOutputArgs, transcript: &Transcript) -> Result<String> {
    let result = transcript
        .find_tool_result(&args.correlation_id)
        .ok_or_else(|| anyhow!("no tool output with id {}", args.correlation_id))?;
    let output = &result.output;
    let start = floor_char_boundary(output, args.offset.min(output.len()));
    let want = args.limit.unwrap_or(DEFAULT_PAGE_BYTES);
    let end = floor_char_boundary(output, start.saturating_add(want).min(output.len()));
    let mut page = format!("[bytes {start}-{end} of {}]\n", output.len());
    page.push_str(&output[start..end]);
    if end < output.len() {
        page.push_str(&format!("\n[more: call again with offset {end}]"));
    }
    Ok(page)
}

/// Workspace-relative form of a path for use inside the sandbox.
fn sandbox_path(handle: &SandboxHandle, requested: &str) -> Result<String> {
    let rel = relative_path(std::path::Path::new(&handle.workspace), requested)?;
    let rel = rel.to_string_lossy().into_owned();
    Ok(if rel.is_empty() { ".".to_string() } else { rel })
}

async fn sandbox_script(
    manager: &SandboxManager,
    handle: &SandboxHandle,
    ctx: &ToolContext<'_>,
    script: &str,
    path: &str,
    stdin: Option<Vec<u8>>,
) -> Result<ExecResult> {
    let request = ExecRequest {
        argv: vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
            path.to_string(),
        ],
        stdin,
        timeout: ctx.exec_timeout,
        output_limit_bytes: ctx.output_limit_bytes,
    };
    manager.exec(handle, &request).await
}

fn checked_stdout(result: ExecResult, path: &str) -> Result<String> {
    if !result.exit.success() {
        bail!("{path}: {}", result.stderr.trim());
    }
    let mut out = result.stdout;
    if result.truncated {
        out.push_str("\n[output truncated at byte limit]");
    }
    Ok(out)
}

/// Apply `regex` to `path:line:text` records listed inside the sandbox.
fn filter_scan(result: ExecResult, regex: &Regex, pattern: &str) -> Result<String> {
    // grep exits 1 when there were no lines at all.
    match result.exit {
        ExitStatus::Exited(0) => {}
        ExitStatus::Exited(1) if result.stdout.is_empty() => {
            return Ok(format!("no matches for {pattern:?}"));
        }
        _ if result.stdout.is_empty() => bail!("search failed: {}", result.stderr.trim()),
        _ => {}
    }
    let mut hits = Vec::new();
    let mut truncated = false;
    for record in result.stdout.lines() {
        let Some((path, rest)) = record.split_once(':') else {
            continue;
        };
        let Some((line_no, text)) = rest.split_once(':') else {
            continue;
        };
        if !regex.is_match(text) {
            continue;
        }
        if hits.len() == MAX_SEARCH_HITS {
            truncated = true;
            break;
        }
        let path = path.strip_prefix("./").unwrap_or(path);
        hits.push(format!("{path}:{line_no}: {}", text.trim_end()));
    }
    if hits.is_empty() && !result.truncated {
        return Ok(format!("no matches for {pattern:?}"));
    }
    let mut out = hits.join("\n");
    if truncated {
        out.push_str(&format!("\n[stopped after {MAX_SEARCH_HITS} matches]"));
    } else if result.truncated {
        out.push_str("\n[search incomplete: scanned output hit the size limit]");
    }
    Ok(out)
}

fn detached() -> anyhow::Error {
    anyhow!("no worktree is open for this thread")
}

async fn blocking<F>(f: F) -> Result<String>
where
    F: FnOnce() -> Result<String> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("join tool task")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Message, ToolStatus};
    use crate::sandbox::Provision;
    use crate::test_support::FakeRuntime;
    use serde_json::json;

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: "c1".to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    fn host_ctx<'a>(root: &std::path::Path, transcript: &'a Transcript) -> ToolContext<'a> {
        ToolContext {
            target: ExecTarget::Host {
                root: root.to_path_buf(),
            },
            transcript,
            exec_timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        }
    }

    #[tokio::test]
    async fn unknown_and_invalid_calls_become_error_results() {
        let registry = ToolRegistry::new(&ToolKind::ALL).expect("registry");
        let transcript = Transcript::default();
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = host_ctx(temp.path(), &transcript);

        let unknown = registry.dispatch(&call("delete_repo", json!({})), &ctx).await;
        assert_eq!(unknown.error_kind, Some(ToolErrorKind::UnknownTool));

        let invalid = registry
            .dispatch(&call("write_file", json!({"path": "a.txt"})), &ctx)
            .await;
        assert_eq!(invalid.error_kind, Some(ToolErrorKind::InvalidArguments));
        assert!(!temp.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn host_write_and_run_command() {
        let registry = ToolRegistry::new(&ToolKind::ALL).expect("registry");
        let transcript = Transcript::default();
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = host_ctx(temp.path(), &transcript);

        let wrote = registry
            .dispatch(
                &call("Write-File", json!({"path": "notes.txt", "content": "hello\n"})),
                &ctx,
            )
            .await;
        assert_eq!(wrote.status, ToolStatus::Ok, "{}", wrote.output);

        let ran = registry
            .dispatch(&call("run_command", json!({"command": "cat notes.txt"})), &ctx)
            .await;
        assert!(ran.output.contains("exit code: 0"));
        assert!(ran.output.contains("hello"));
    }

    #[tokio::test]
    async fn stringified_arguments_are_repaired_before_validation() {
        let registry = ToolRegistry::new(&ToolKind::ALL).expect("registry");
        let transcript = Transcript::default();
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = host_ctx(temp.path(), &transcript);

        let wrote = registry
            .dispatch(
                &call(
                    "write_file",
                    json!("{'path': \"notes.txt\", \"content\": \"hi\",}"),
                ),
                &ctx,
            )
            .await;
        assert_eq!(wrote.status, ToolStatus::Ok, "{}", wrote.output);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("notes.txt")).expect("read"),
            "hi"
        );

        let garbled = registry
            .dispatch(&call("write_file", json!("path=notes.txt")), &ctx)
            .await;
        assert_eq!(garbled.error_kind, Some(ToolErrorKind::InvalidArguments));
    }

    #[tokio::test]
    async fn escaping_path_is_execution_failure() {
        let registry = ToolRegistry::new(&ToolKind::ALL).expect("registry");
        let transcript = Transcript::default();
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = host_ctx(temp.path(), &transcript);

        let result = registry
            .dispatch(&call("read_file", json!({"path": "../../etc/passwd"})), &ctx)
            .await;
        assert_eq!(result.error_kind, Some(ToolErrorKind::ExecutionFailed));
    }

    #[tokio::test]
    async fn detached_target_only_runs_pure_tools() {
        let registry = ToolRegistry::new(&ToolKind::ALL).expect("registry");
        let transcript = Transcript::default();
        let ctx = ToolContext {
            target: ExecTarget::Detached,
            transcript: &transcript,
            exec_timeout: Duration::from_secs(1),
            output_limit_bytes: 100,
        };
        let time = registry.dispatch(&call("current_time", json!({})), &ctx).await;
        assert!(time.is_ok());
        let read = registry
            .dispatch(&call("read_file", json!({"path": "x"})), &ctx)
            .await;
        assert_eq!(read.error_kind, Some(ToolErrorKind::ExecutionFailed));
    }

    #[tokio::test]
    async fn read_tool_output_pages_full_result() {
        let registry = ToolRegistry::new(&ToolKind::ALL).expect("registry");
        let mut transcript = Transcript::default();
        transcript.append(Message::tool_result(ToolResult::ok("big", "abcdefghij")));
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = host_ctx(temp.path(), &transcript);

        let page = registry
            .dispatch(
                &call(
                    "read_tool_output",
                    json!({"correlation_id": "big", "offset": 2, "limit": 3}),
                ),
                &ctx,
            )
            .await;
        assert!(page.output.starts_with("[bytes 2-5 of 10]\ncde"));
        assert!(page.output.contains("offset 5"));
    }

    #[tokio::test]
    async fn sandbox_target_writes_through_runtime() {
        let registry = ToolRegistry::new(&ToolKind::ALL).expect("registry");
        let transcript = Transcript::default();
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = Arc::new(SandboxManager::new(
            Arc::new(FakeRuntime::available()),
            "/workspace",
        ));
        let Provision::Ready(handle) = manager
            .provision(
                &crate::core::types::ThreadId::new("t"),
                temp.path().to_path_buf(),
            )
            .await
            .expect("provision")
        else {
            panic!("expected ready");
        };
        let ctx = ToolContext {
            target: ExecTarget::Sandbox {
                manager: manager.clone(),
                handle,
            },
            transcript: &transcript,
            exec_timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        };

        let wrote = registry
            .dispatch(
                &call(
                    "write_file",
                    json!({"path": "/workspace/sub/notes.txt", "content": "line\n", "append": true}),
                ),
                &ctx,
            )
            .await;
        assert!(wrote.is_ok(), "{}", wrote.output);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("sub/notes.txt")).expect("read"),
            "line\n"
        );

        let listed = registry
            .dispatch(&call("list_directory", json!({})), &ctx)
            .await;
        assert_eq!(listed.output, "sub/");

        let found = registry
            .dispatch(&call("search_files", json!({"pattern": "li.e"})), &ctx)
            .await;
        assert_eq!(found.output, "sub/notes.txt:1: line");

        // Perl-style classes and inline flags match the same way on both targets.
        let classes = registry
            .dispatch(
                &call("search_files", json!({"pattern": r"(?i)^LINE\b\s*$"})),
                &ctx,
            )
            .await;
        assert_eq!(classes.output, "sub/notes.txt:1: line");
        let host = registry
            .dispatch(
                &call("search_files", json!({"pattern": r"(?i)^LINE\b\s*$"})),
                &host_ctx(temp.path(), &transcript),
            )
            .await;
        assert_eq!(host.output, classes.output);
    }

    #[test]
    fn scan_filter_applies_regex_to_line_text() {
        let result = ExecResult {
            exit: ExitStatus::Exited(0),
            stdout: "./a.txt:1:id 42\n./a.txt:2:no digits\nb.txt:3:x:7\n".to_string(),
            stderr: String::new(),
            truncated: false,
        };
        let regex = Regex::new(r"\d").expect("regex");
        let out = filter_scan(result, &regex, r"\d").expect("filter");
        assert_eq!(out, "a.txt:1: id 42\nb.txt:3: x:7");
    }
}
