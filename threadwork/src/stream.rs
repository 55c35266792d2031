//! Events emitted while a turn runs, and their client-facing encodings.
//!
//! A turn writes into a [`StreamSink`]; exactly one [`StreamReader`] consumes
//! the events. Frames follow the chat-completions streaming format so
//! existing clients can render replies, with tool activity carried as extra
//! deltas and SSE comments.

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::context::floor_char_boundary;
use crate::core::types::{ThreadId, ThreadStatus, ToolCall, ToolResult, ToolStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental assistant text.
    Delta { text: String },
    /// A failed generation attempt is being retried. The last
    /// `discard_bytes` of reply text came from that attempt and are void.
    Retry { attempt: u32, discard_bytes: usize },
    ToolStarted { call: ToolCall },
    ToolFinished {
        correlation_id: String,
        status: ToolStatus,
        size: usize,
    },
    /// The turn ended; `status` is the thread status afterwards.
    Done { status: ThreadStatus },
    /// The turn failed; no further events follow.
    Error { message: String },
}

impl StreamEvent {
    pub fn tool_finished(result: &ToolResult) -> Self {
        StreamEvent::ToolFinished {
            correlation_id: result.correlation_id.clone(),
            status: result.status,
            size: result.size,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

/// Fixed fields of every chunk in one response.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub id: String,
    pub model: String,
    pub created: i64,
}

impl ChunkMeta {
    pub fn for_thread(thread_id: &ThreadId, model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{thread_id}"),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    fn chunk(&self, delta: serde_json::Value, finish_reason: Option<&str>) -> String {
        let chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
        });
        format!("data: {chunk}\n\n")
    }
}

/// First frame of a response, announcing the assistant role.
pub fn role_frame(meta: &ChunkMeta) -> String {
    meta.chunk(json!({ "role": "assistant" }), None)
}

/// Encode one event as server-sent-event frames.
pub fn to_sse_frame(event: &StreamEvent, meta: &ChunkMeta) -> String {
    match event {
        StreamEvent::Delta { text } => meta.chunk(json!({ "content": text }), None),
        StreamEvent::Retry {
            attempt,
            discard_bytes,
        } => {
            let body = json!({ "attempt": attempt, "discard_bytes": discard_bytes });
            format!("event: retry\ndata: {body}\n\n")
        }
        StreamEvent::ToolStarted { call } => meta.chunk(
            json!({
                "tool_calls": [{
                    "index": 0,
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    },
                }]
            }),
            None,
        ),
        StreamEvent::ToolFinished {
            correlation_id,
            status,
            size,
        } => {
            let status = match status {
                ToolStatus::Ok => "ok",
                ToolStatus::Error => "error",
            };
            format!(": tool_result {correlation_id} {status} {size}\n\n")
        }
        StreamEvent::Done { status } => {
            let reason = match status {
                ThreadStatus::Cancelled => "cancelled",
                _ => "stop",
            };
            let mut frames = meta.chunk(json!({}), Some(reason));
            frames.push_str("data: [DONE]\n\n");
            frames
        }
        StreamEvent::Error { message } => {
            let body = json!({ "error": { "message": message, "type": "engine_error" } });
            format!("event: error\ndata: {body}\n\ndata: [DONE]\n\n")
        }
    }
}

/// Producer half, owned by the running turn.
#[derive(Debug, Clone)]
pub struct StreamSink {
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl StreamSink {
    /// A sink that drops every event.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx
            && tx.send(event).is_err()
        {
            debug!("stream reader gone, dropping event");
        }
    }
}

/// Single consumer of a turn's events.
///
/// Tracks the insertion cursor (bytes of reply text delivered so far) so a
/// client inserting deltas into a buffer knows where the next one goes. A
/// `Retry` moves the cursor back over the voided text.
#[derive(Debug)]
pub struct StreamReader {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
    cursor: usize,
    text: String,
    finished: bool,
}

/// Connected sink/reader pair; cancelling the reader cancels `cancel`.
pub fn channel(cancel: CancellationToken) -> (StreamSink, StreamReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        StreamSink { tx: Some(tx) },
        StreamReader {
            rx,
            cancel,
            cursor: 0,
            text: String::new(),
            finished: false,
        },
    )
}

impl StreamReader {
    /// Next event, or `None` after the terminal one.
    ///
    /// After [`StreamReader::cancel`] the reader stops reading and yields a
    /// synthetic `Done { status: Cancelled }`.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = tokio::select! {
            biased;
            () = self.cancel.cancelled() => StreamEvent::Done { status: ThreadStatus::Cancelled },
            event = self.rx.recv() => match event {
                Some(event) => event,
                None => StreamEvent::Error { message: "turn ended without a result".to_string() },
            },
        };
        match &event {
            StreamEvent::Delta { text } => {
                self.cursor += text.len();
                self.text.push_str(text);
            }
            StreamEvent::Retry { discard_bytes, .. } => {
                let keep = self.text.len().saturating_sub(*discard_bytes);
                self.text.truncate(floor_char_boundary(&self.text, keep));
                self.cursor = self.text.len();
            }
            _ => {}
        }
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }

    /// Stop the turn.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Reply text received so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Read to the end and return the terminal event.
    pub async fn collect(&mut self) -> Option<StreamEvent> {
        let mut last = None;
        while let Some(event) = self.next().await {
            last = Some(event);
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ChunkMeta {
        ChunkMeta {
            id: "chatcmpl-t1".to_string(),
            model: "threadwork".to_string(),
            created: 1_700_000_000,
        }
    }

    #[test]
    fn delta_frame_is_chat_completion_chunk() {
        let frame = to_sse_frame(
            &StreamEvent::Delta {
                text: "hi".to_string(),
            },
            &meta(),
        );
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        let body: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("data: ").trim()).expect("json");
        assert_eq!(body["object"], "chat.completion.chunk");
        assert_eq!(body["choices"][0]["delta"]["content"], "hi");
    }

    #[test]
    fn done_and_error_terminate_stream() {
        let done = to_sse_frame(
            &StreamEvent::Done {
                status: ThreadStatus::Completed,
            },
            &meta(),
        );
        assert!(done.contains("\"finish_reason\":\"stop\""));
        assert!(done.ends_with("data: [DONE]\n\n"));

        let err = to_sse_frame(
            &StreamEvent::Error {
                message: "boom".to_string(),
            },
            &meta(),
        );
        assert!(err.starts_with("event: error\n"));
        assert!(err.contains("boom"));
    }

    #[tokio::test]
    async fn reader_tracks_cursor_and_stops_after_terminal() {
        let (sink, mut reader) = channel(CancellationToken::new());
        sink.emit(StreamEvent::Delta {
            text: "ab".to_string(),
        });
        sink.emit(StreamEvent::Delta {
            text: "cde".to_string(),
        });
        sink.emit(StreamEvent::Done {
            status: ThreadStatus::Completed,
        });
        sink.emit(StreamEvent::Delta {
            text: "late".to_string(),
        });

        let last = reader.collect().await;
        assert_eq!(
            last,
            Some(StreamEvent::Done {
                status: ThreadStatus::Completed
            })
        );
        assert_eq!(reader.cursor(), 5);
        assert_eq!(reader.text(), "abcde");
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn retry_rewinds_voided_text() {
        let (sink, mut reader) = channel(CancellationToken::new());
        sink.emit(StreamEvent::Delta {
            text: "Done. ".to_string(),
        });
        sink.emit(StreamEvent::Delta {
            text: "parti".to_string(),
        });
        sink.emit(StreamEvent::Retry {
            attempt: 2,
            discard_bytes: 5,
        });
        sink.emit(StreamEvent::Delta {
            text: "full".to_string(),
        });
        sink.emit(StreamEvent::Done {
            status: ThreadStatus::Completed,
        });

        reader.collect().await;
        assert_eq!(reader.text(), "Done. full");
        assert_eq!(reader.cursor(), 10);
    }

    #[test]
    fn retry_frame_is_named_event() {
        let frame = to_sse_frame(
            &StreamEvent::Retry {
                attempt: 2,
                discard_bytes: 7,
            },
            &meta(),
        );
        assert!(frame.starts_with("event: retry\n"));
        assert!(frame.contains("\"discard_bytes\":7"));
    }

    #[tokio::test]
    async fn cancel_yields_synthetic_terminal_event() {
        let token = CancellationToken::new();
        let (_sink, mut reader) = channel(token.clone());
        reader.cancel();
        assert!(token.is_cancelled());
        assert_eq!(
            reader.next().await,
            Some(StreamEvent::Done {
                status: ThreadStatus::Cancelled
            })
        );
        assert!(reader.next().await.is_none());
    }
}
