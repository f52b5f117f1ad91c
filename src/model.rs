//! Task state machine and persisted data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::{ChatMessage, CompletionSettings, ToolCallRequest};

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// A turn is in flight (or the task is between turns).
    Running,
    /// The turn stopped for human approval of pending tool calls.
    Paused,
    /// The task produced its final answer.
    Completed,
    /// The engine gave up on the task.
    Failed,
    /// The user rejected the pending tool calls.
    Canceled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Canceled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// Who a task item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemRole {
    User,
    Assistant,
}

/// Content payload of a task item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemContent {
    Text { text: String },
    Structured { value: serde_json::Value },
}

/// Delivery mode of the turn that produced an item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    #[default]
    Batch,
    Streaming,
}

/// One entry in a task's ordered item list.
///
/// `pending_tool_calls` and `chat_history` are present only on the item that
/// caused a pause: the snapshot is what lets resumption reconstruct the
/// conversation without replaying the whole task from items alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub task_id: String,
    pub request_id: String,
    pub role: ItemRole,
    pub content: ItemContent,
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pending_tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chat_history: Option<Vec<ChatMessage>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mode: Option<TurnMode>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub settings: Option<CompletionSettings>,
}

impl TaskItem {
    fn base(task_id: &str, request_id: &str, role: ItemRole, content: ItemContent) -> Self {
        Self {
            task_id: task_id.to_string(),
            request_id: request_id.to_string(),
            role,
            content,
            updated: Utc::now(),
            pending_tool_calls: None,
            chat_history: None,
            mode: None,
            settings: None,
        }
    }

    /// The user's request text.
    pub fn user_text(task_id: &str, request_id: &str, text: impl Into<String>) -> Self {
        Self::base(
            task_id,
            request_id,
            ItemRole::User,
            ItemContent::Text { text: text.into() },
        )
    }

    /// The assistant's final answer for a turn.
    pub fn assistant_text(task_id: &str, request_id: &str, text: impl Into<String>) -> Self {
        Self::base(
            task_id,
            request_id,
            ItemRole::Assistant,
            ItemContent::Text { text: text.into() },
        )
    }

    /// The item recorded when a turn pauses for approval. Carries the full
    /// conversation snapshot and the raw intervention call set.
    pub fn paused(
        task_id: &str,
        request_id: &str,
        chat_history: Vec<ChatMessage>,
        pending: Vec<ToolCallRequest>,
        mode: TurnMode,
        settings: CompletionSettings,
    ) -> Self {
        let names: Vec<String> = pending.iter().map(|c| c.qualified_name()).collect();
        let mut item = Self::base(
            task_id,
            request_id,
            ItemRole::Assistant,
            ItemContent::Structured {
                value: serde_json::json!({
                    "event": "approval_requested",
                    "tools": names,
                }),
            },
        );
        item.pending_tool_calls = Some(pending);
        item.chat_history = Some(chat_history);
        item.mode = Some(mode);
        item.settings = Some(settings);
        item
    }

    /// Marker appended when the user approves pending calls.
    pub fn approval_marker(task_id: &str, request_id: &str) -> Self {
        Self::base(
            task_id,
            request_id,
            ItemRole::User,
            ItemContent::Structured {
                value: serde_json::json!({ "event": "approved" }),
            },
        )
    }

    /// Marker appended when the user rejects pending calls.
    pub fn rejection_marker(task_id: &str, request_id: &str) -> Self {
        Self::base(
            task_id,
            request_id,
            ItemRole::User,
            ItemContent::Structured {
                value: serde_json::json!({ "event": "rejected" }),
            },
        )
    }

    fn marker_event(&self) -> Option<&str> {
        match &self.content {
            ItemContent::Structured { value } => value.get("event").and_then(|v| v.as_str()),
            ItemContent::Text { .. } => None,
        }
    }

    pub fn is_rejection_marker(&self) -> bool {
        self.marker_event() == Some("rejected")
    }

    pub fn is_approval_marker(&self) -> bool {
        self.marker_event() == Some("approved")
    }
}

/// A persisted task: the unit of execution, pause, and resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub session_id: String,
    pub user_id: String,
    pub items: Vec<TaskItem>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Task {
    pub fn new(
        task_id: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            items: Vec::new(),
            status: TaskStatus::Running,
            created_at: now,
            last_updated: now,
        }
    }

    pub fn with_item(mut self, item: TaskItem) -> Self {
        self.push_item(item);
        self
    }

    /// Append an item and bump `last_updated`.
    pub fn push_item(&mut self, item: TaskItem) {
        self.items.push(item);
        self.last_updated = Utc::now();
    }

    pub fn last_item(&self) -> Option<&TaskItem> {
        self.items.last()
    }

    /// Move to a new status, bumping `last_updated`.
    ///
    /// Illegal transitions are applied anyway (the store is the source of
    /// truth and resume-time checks fail loudly on bad states) but logged.
    pub fn set_status(&mut self, status: TaskStatus) {
        if !self.status.can_transition_to(status) && self.status != status {
            tracing::warn!(
                task_id = %self.task_id,
                from = %self.status,
                to = %status,
                "Unexpected task status transition"
            );
        }
        self.status = status;
        self.last_updated = Utc::now();
    }

    /// The distinct request ids owned by this task's items, in first-seen order.
    pub fn request_ids(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for item in &self.items {
            if !seen.contains(&item.request_id) {
                seen.push(item.request_id.clone());
            }
        }
        seen
    }

    /// Schema-level validation applied by the store on every decode.
    /// A record that fails here is treated as corrupted.
    pub fn validate(&self) -> Result<(), String> {
        if self.task_id.is_empty() {
            return Err("empty task_id".into());
        }
        if self.user_id.is_empty() {
            return Err("empty user_id".into());
        }
        for (i, item) in self.items.iter().enumerate() {
            if item.task_id != self.task_id {
                return Err(format!(
                    "item {} belongs to task '{}', not '{}'",
                    i, item.task_id, self.task_id
                ));
            }
            if item.request_id.is_empty() {
                return Err(format!("item {} has an empty request_id", i));
            }
        }
        Ok(())
    }
}
