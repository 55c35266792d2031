//! Prompt rendering: the per-call system prompt and side requests.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::io::git::Change;
use crate::tools::ToolKind;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const MERGE_SUMMARY_TEMPLATE: &str = include_str!("prompts/merge_summary.md");
const TITLE_TEMPLATE: &str = include_str!("prompts/title.md");

/// Diff bytes shown to the model when summarizing a merge.
const SUMMARY_DIFF_BYTES: usize = 20_000;

/// Inputs for the system prompt of one model call.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub domain: &'a str,
    pub default_branch: &'a str,
    /// Thread branch, once the domain was opened.
    pub branch: Option<&'a str>,
    /// Whether commands run in a container.
    pub sandboxed: bool,
    /// Repository root as seen by commands.
    pub workspace: &'a str,
    pub tools: &'a [ToolKind],
}

/// Inputs for the merge commit summary request.
#[derive(Debug, Clone)]
pub struct MergeSummaryInputs<'a> {
    pub default_branch: &'a str,
    pub title: Option<&'a str>,
    /// `git log --oneline` of the target branch.
    pub recent_commits: &'a str,
    pub changes: &'a [Change],
}

#[derive(Debug, Serialize)]
struct ToolLine {
    name: &'static str,
    description: &'static str,
}

/// Template engine wrapper around minijinja.
#[derive(Debug)]
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("load system prompt template")?;
        env.add_template("merge_summary", MERGE_SUMMARY_TEMPLATE)
            .context("load merge summary template")?;
        env.add_template("title", TITLE_TEMPLATE)
            .context("load title template")?;
        Ok(Self { env })
    }

    pub fn render_system(&self, input: &PromptInputs<'_>) -> Result<String> {
        let tools: Vec<ToolLine> = input
            .tools
            .iter()
            .map(|kind| ToolLine {
                name: kind.name(),
                description: kind.description(),
            })
            .collect();
        let template = self.env.get_template("system")?;
        let rendered = template
            .render(context! {
                domain => input.domain,
                default_branch => input.default_branch,
                branch => input.branch,
                sandboxed => input.sandboxed,
                workspace => input.workspace,
                tools => tools,
                pager => input.tools.contains(&ToolKind::ReadToolOutput),
            })
            .context("render system prompt")?;
        Ok(rendered.trim().to_string())
    }

    /// Request for a one-line merge commit message. Diffs beyond a fixed
    /// size are left out and counted.
    pub fn render_merge_summary(&self, input: &MergeSummaryInputs<'_>) -> Result<String> {
        let mut shown = Vec::new();
        let mut used = 0;
        for change in input.changes {
            if used + change.diff.len() > SUMMARY_DIFF_BYTES && !shown.is_empty() {
                break;
            }
            used += change.diff.len();
            shown.push(change);
        }
        let elided = input.changes.len() - shown.len();
        let template = self.env.get_template("merge_summary")?;
        let rendered = template
            .render(context! {
                default_branch => input.default_branch,
                title => input.title,
                recent_commits => input.recent_commits.trim(),
                changes => shown,
                elided => elided,
            })
            .context("render merge summary prompt")?;
        Ok(rendered.trim().to_string())
    }

    /// Instruction for describing a conversation in a few words.
    pub fn render_title(&self) -> Result<String> {
        let template = self.env.get_template("title")?;
        let rendered = template.render(()).context("render title prompt")?;
        Ok(rendered.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_tools_and_sandbox_mode() {
        let engine = PromptEngine::new().expect("engine");
        let tools = [ToolKind::ReadFile, ToolKind::RunCommand];
        let prompt = engine
            .render_system(&PromptInputs {
                domain: "notes",
                default_branch: "main",
                branch: Some("thread/abc"),
                sandboxed: true,
                workspace: "/workspace",
                tools: &tools,
            })
            .expect("render");
        assert!(prompt.contains("`notes`"));
        assert!(prompt.contains("`thread/abc`"));
        assert!(prompt.contains("mounted at `/workspace`"));
        assert!(prompt.contains("- `read_file`:"));
        assert!(prompt.contains("- `run_command`:"));
        assert!(!prompt.contains("read_tool_output"));
    }

    #[test]
    fn unsandboxed_prompt_warns_about_host_execution() {
        let engine = PromptEngine::new().expect("engine");
        let tools = [ToolKind::ReadToolOutput];
        let prompt = engine
            .render_system(&PromptInputs {
                domain: "code",
                default_branch: "main",
                branch: None,
                sandboxed: false,
                workspace: "/tmp/wt",
                tools: &tools,
            })
            .expect("render");
        assert!(prompt.contains("without isolation"));
        assert!(prompt.contains("page through"));
    }

    #[test]
    fn merge_summary_lists_changes_and_elides_overflow() {
        let engine = PromptEngine::new().expect("engine");
        let changes = vec![
            Change {
                path: "notes.txt".to_string(),
                diff: "+second".to_string(),
            },
            Change {
                path: "big.bin".to_string(),
                diff: "x".repeat(SUMMARY_DIFF_BYTES),
            },
        ];
        let prompt = engine
            .render_merge_summary(&MergeSummaryInputs {
                default_branch: "main",
                title: Some("Append second note"),
                recent_commits: "abc123 initial commit\n",
                changes: &changes,
            })
            .expect("render");
        assert!(prompt.contains("File: notes.txt\n+second"));
        assert!(!prompt.contains("File: big.bin"));
        assert!(prompt.contains("1 more file(s) not shown"));
        assert!(prompt.contains("The thread was about: Append second note"));
        assert!(prompt.contains("abc123 initial commit"));
    }

    #[test]
    fn title_prompt_asks_for_five_words() {
        let engine = PromptEngine::new().expect("engine");
        assert!(engine.render_title().expect("render").contains("five words"));
    }
}
