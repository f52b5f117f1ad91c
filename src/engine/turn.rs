//! The iterative turn loop.
//!
//! Extracted from the engine entry points to keep the core shape — call the
//! completion service, execute tools, repeat until a text-only reply — in
//! one focused module.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::engine::{TaskExecutionEngine, TurnOutcome};
use crate::error::{EngineError, ToolError};
use crate::llm::{ChatMessage, CompletionSettings, MessageContent, StreamEvent, ToolCallRequest};
use crate::model::{Task, TaskItem, TaskStatus, TurnMode};

/// How a turn's text reaches the caller.
pub enum Delivery {
    /// The final answer is returned whole.
    Batch,
    /// Text chunks are forwarded as they arrive. A closed receiver does not
    /// abort the turn; the text still lands in the persisted answer.
    Streaming(mpsc::Sender<String>),
}

pub(super) fn delivery_mode(delivery: &Delivery) -> TurnMode {
    match delivery {
        Delivery::Batch => TurnMode::Batch,
        Delivery::Streaming(_) => TurnMode::Streaming,
    }
}

impl TaskExecutionEngine {
    /// Drive turns until a final answer, a pause, or the turn guard trips.
    ///
    /// Sequential per task: every turn (including its concurrent tool
    /// calls) fully completes before the next begins. A tool failure aborts
    /// the turn with no partial persistence — the task keeps the status it
    /// had before the turn.
    pub(super) async fn run_turn_loop(
        &self,
        task: &mut Task,
        request_id: &str,
        settings: &CompletionSettings,
        mut history: Vec<ChatMessage>,
        delivery: &Delivery,
        session_notice: Option<String>,
    ) -> Result<TurnOutcome, EngineError> {
        let limit = self.config.max_turns;

        for turn in 1..=limit {
            let reply = self.next_reply(&history, settings, delivery).await?;
            let (texts, calls) = split_reply(&reply);

            if calls.is_empty() {
                let answer = texts.join("\n");
                let task_id = task.task_id.clone();
                task.push_item(TaskItem::assistant_text(&task_id, request_id, answer.clone()));
                task.set_status(TaskStatus::Completed);
                self.deps.tasks.update(task).await?;
                tracing::info!(task_id = %task_id, turns = turn, "Task completed");
                return Ok(TurnOutcome::Completed {
                    task_id,
                    answer,
                    session_notice,
                });
            }

            // The assistant's request (text narration + tool calls) becomes
            // part of the conversation before anything executes, so a pause
            // snapshot always contains it.
            history.extend(reply);

            let (immediate, intervention) = self.policy.partition(calls);
            tracing::debug!(
                task_id = %task.task_id,
                turn,
                immediate = immediate.len(),
                intervention = intervention.len(),
                "Turn requested tool calls"
            );

            if !immediate.is_empty() {
                let results = self.execute_calls(&immediate).await?;
                history.extend(results);
            }

            if !intervention.is_empty() {
                let task_id = task.task_id.clone();
                task.push_item(TaskItem::paused(
                    &task_id,
                    request_id,
                    history.clone(),
                    intervention.clone(),
                    delivery_mode(delivery),
                    settings.clone(),
                ));
                task.set_status(TaskStatus::Paused);
                self.deps.tasks.update(task).await?;
                tracing::info!(
                    task_id = %task_id,
                    pending = intervention.len(),
                    "Task paused for approval"
                );
                return Ok(TurnOutcome::Paused(self.pause_descriptor(
                    &task_id,
                    request_id,
                    intervention,
                )));
            }
        }

        // Ran out of turns: this is the engine's own unrecoverable decision,
        // so the task is failed rather than left Running.
        let task_id = task.task_id.clone();
        task.set_status(TaskStatus::Failed);
        self.deps.tasks.update(task).await?;
        Err(EngineError::TurnLimitExceeded { task_id, limit })
    }

    /// One completion round, batch or streaming. Returns the assistant's
    /// reply as messages ready to append to the history.
    async fn next_reply(
        &self,
        history: &[ChatMessage],
        settings: &CompletionSettings,
        delivery: &Delivery,
    ) -> Result<Vec<ChatMessage>, EngineError> {
        match delivery {
            Delivery::Batch => Ok(self.deps.completion.complete(history, settings).await?),
            Delivery::Streaming(sink) => {
                let mut stream = self
                    .deps
                    .completion
                    .complete_stream(history, settings)
                    .await?;

                let mut text = String::new();
                let mut calls: Vec<ToolCallRequest> = Vec::new();

                while let Some(event) = stream.next().await {
                    match event? {
                        StreamEvent::TextDelta(delta) => {
                            // Already-delivered text is never retracted,
                            // even if the turn later pauses or fails.
                            if sink.send(delta.clone()).await.is_err() {
                                tracing::debug!("Streaming receiver dropped, turn continues");
                            }
                            text.push_str(&delta);
                        }
                        StreamEvent::ToolCalls(batch) => calls.extend(batch),
                        StreamEvent::Done => break,
                    }
                }

                let mut reply = Vec::new();
                if !text.is_empty() {
                    reply.push(ChatMessage::assistant(text));
                }
                if !calls.is_empty() {
                    reply.push(ChatMessage::tool_calls(calls));
                }
                Ok(reply)
            }
        }
    }

    /// Execute a batch of tool calls concurrently with an all-or-nothing
    /// join: every call is awaited, then any single failure fails the whole
    /// batch and no results are returned. Successes come back as tool-result
    /// messages in the original call order.
    pub(super) async fn execute_calls(
        &self,
        calls: &[ToolCallRequest],
    ) -> Result<Vec<ChatMessage>, EngineError> {
        let mut join_set = JoinSet::new();
        for (idx, call) in calls.iter().enumerate() {
            let invoker = self.deps.invoker.clone();
            let call = call.clone();
            join_set.spawn(async move {
                let result = invoker.invoke(&call).await;
                (idx, call, result)
            });
        }

        let mut slots: Vec<Option<ChatMessage>> = calls.iter().map(|_| None).collect();
        let mut first_error: Option<ToolError> = None;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, call, Ok(result))) => {
                    slots[idx] = Some(ChatMessage::tool_result(
                        call.call_id.clone(),
                        call.qualified_name(),
                        result,
                    ));
                }
                Ok((_, call, Err(e))) => {
                    tracing::warn!(
                        call_id = %call.call_id,
                        tool = %call.qualified_name(),
                        error = %e,
                        "Tool call failed, aborting turn"
                    );
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "Tool call task panicked");
                    if first_error.is_none() {
                        first_error = Some(ToolError::InvocationFailed {
                            name: "unknown".into(),
                            reason: format!("task join error: {}", join_error),
                        });
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e.into());
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

/// Partition a reply into its text parts and requested tool calls.
fn split_reply(reply: &[ChatMessage]) -> (Vec<&str>, Vec<ToolCallRequest>) {
    let mut texts = Vec::new();
    let mut calls = Vec::new();
    for message in reply {
        match &message.content {
            MessageContent::Text { text } => texts.push(text.as_str()),
            MessageContent::ToolCalls { calls: requested } => calls.extend(requested.clone()),
            MessageContent::ToolResult { .. } => {
                tracing::warn!("Completion reply contained a tool result, ignoring");
            }
        }
    }
    (texts, calls)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest {
            call_id: id.into(),
            plugin: "p".into(),
            function: "f".into(),
            arguments: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_split_reply_partitions() {
        let reply = vec![
            ChatMessage::assistant("thinking out loud"),
            ChatMessage::tool_calls(vec![call("c1"), call("c2")]),
        ];
        let (texts, calls) = split_reply(&reply);
        assert_eq!(texts, vec!["thinking out loud"]);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].call_id, "c1");
    }

    #[test]
    fn test_split_reply_ignores_stray_results() {
        let reply = vec![ChatMessage::tool_result("c1", "p.f", "out")];
        let (texts, calls) = split_reply(&reply);
        assert!(texts.is_empty());
        assert!(calls.is_empty());
    }

    #[test]
    fn test_delivery_mode() {
        assert_eq!(delivery_mode(&Delivery::Batch), TurnMode::Batch);
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(delivery_mode(&Delivery::Streaming(tx)), TurnMode::Streaming);
    }
}
