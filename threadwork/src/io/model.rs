//! Model provider seam.
//!
//! The wire protocol of a concrete provider lives outside this crate; the
//! engine only needs a stream of generation events for a bounded view.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::core::types::{Message, ToolCall};

/// Tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// One event of a streamed model reply.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// Incremental reply text.
    TextDelta(String),
    /// A complete tool call.
    ToolCall(ToolCall),
    /// End of reply; a stream without it is incomplete.
    Finished,
}

pub type GenerationStream = BoxStream<'static, Result<GenerationEvent>>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Start one generation for `view`.
    ///
    /// Failing to start, an `Err` item, or a stream that ends without
    /// [`GenerationEvent::Finished`] all count as one failed attempt.
    async fn generate(
        &self,
        view: &[Message],
        tools: &[ToolDeclaration],
    ) -> Result<GenerationStream>;
}

/// Run one tool-free generation and return its trimmed text.
///
/// Used for short side requests such as merge summaries and titles. Tool
/// calls in the reply are ignored.
pub async fn complete(model: &dyn ModelClient, messages: &[Message]) -> Result<String> {
    let mut stream = model
        .generate(messages, &[])
        .await
        .context("start completion")?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            GenerationEvent::TextDelta(delta) => text.push_str(&delta),
            GenerationEvent::ToolCall(_) => {}
            GenerationEvent::Finished => return Ok(text.trim().to_string()),
        }
    }
    bail!("completion ended before the reply finished")
}

/// Client for processes that never generate, such as the operator CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct Offline;

#[async_trait]
impl ModelClient for Offline {
    async fn generate(
        &self,
        _view: &[Message],
        _tools: &[ToolDeclaration],
    ) -> Result<GenerationStream> {
        bail!("no model client configured")
    }
}
