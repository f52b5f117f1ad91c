//! Task execution engine.
//!
//! Owns the task state machine and ties persistence, discovery, completion,
//! and tool invocation together. Per task the turn loop is strictly
//! sequential — a turn fully completes (including all of its concurrent
//! tool calls) before the next begins. Control-flow signals (pause for
//! approval, auth challenge) are returned as [`TurnOutcome`] variants, not
//! errors.

mod turn;

pub use turn::Delivery;

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::{AuthChallenge, AuthChallengeResponse, OAuthCoordinator};
use crate::config::RuntimeConfig;
use crate::discovery::{DiscoveryCoordinator, DiscoveryOutcome};
use crate::engine::turn::delivery_mode;
use crate::error::EngineError;
use crate::llm::{ChatMessage, CompletionService, CompletionSettings, ToolCallRequest};
use crate::model::{Task, TaskItem, TaskStatus};
use crate::store::TaskStore;
use crate::tools::{InterventionPolicy, ToolInvoker};

/// Collaborators the engine is constructed with. All shared, all injected —
/// there is no global state.
pub struct EngineDeps {
    pub completion: Arc<dyn CompletionService>,
    pub invoker: Arc<dyn ToolInvoker>,
    pub tasks: Arc<TaskStore>,
    pub discovery: Arc<DiscoveryCoordinator>,
    pub oauth: Arc<dyn OAuthCoordinator>,
}

/// One incoming user request.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Caller-supplied id; resume and approval URLs are keyed by it.
    pub request_id: String,
    pub session_id: String,
    pub user_id: String,
    pub prompt: String,
    pub settings: CompletionSettings,
}

/// What a caller may do with a paused task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    Approve,
    Reject,
}

impl ResumeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

impl std::str::FromStr for ResumeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown resume action '{}'", other)),
        }
    }
}

/// Returned instead of an answer when a turn pauses for approval.
#[derive(Debug, Clone, PartialEq)]
pub struct PauseDescriptor {
    pub task_id: String,
    pub request_id: String,
    pub approval_url: String,
    pub rejection_url: String,
    /// The calls awaiting approval. Not executed yet.
    pub pending_calls: Vec<ToolCallRequest>,
}

/// The result of executing or resuming a request.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// The task produced its final answer.
    Completed {
        task_id: String,
        answer: String,
        /// One-time session status notice, present at most once per session.
        session_notice: Option<String>,
    },
    /// The turn paused for human approval.
    Paused(PauseDescriptor),
    /// A tool server demands authentication before the request can run.
    /// No task was created or mutated.
    AuthRequired(AuthChallengeResponse),
    /// The user rejected the pending tool calls; the task is canceled.
    Rejected { task_id: String },
}

/// The orchestrator.
pub struct TaskExecutionEngine {
    deps: EngineDeps,
    policy: InterventionPolicy,
    config: RuntimeConfig,
}

impl TaskExecutionEngine {
    pub fn new(deps: EngineDeps, policy: InterventionPolicy, config: RuntimeConfig) -> Self {
        Self {
            deps,
            policy,
            config,
        }
    }

    /// Execute a request to completion, pause, or auth challenge (batch).
    pub async fn execute(&self, request: TaskRequest) -> Result<TurnOutcome, EngineError> {
        self.execute_inner(request, Delivery::Batch).await
    }

    /// Streaming variant: final-turn text is delivered incrementally through
    /// `sink` before the turn is known to be complete. Partial text already
    /// sent is never retracted; tool-call aggregation and pause logic are
    /// identical to batch.
    pub async fn execute_streaming(
        &self,
        request: TaskRequest,
        sink: mpsc::Sender<String>,
    ) -> Result<TurnOutcome, EngineError> {
        self.execute_inner(request, Delivery::Streaming(sink)).await
    }

    /// Resume a paused request (batch).
    pub async fn resume(
        &self,
        request_id: &str,
        action: ResumeAction,
    ) -> Result<TurnOutcome, EngineError> {
        self.resume_inner(request_id, action, Delivery::Batch).await
    }

    /// Resume a paused request, streaming the continued turn's text.
    pub async fn resume_streaming(
        &self,
        request_id: &str,
        action: ResumeAction,
        sink: mpsc::Sender<String>,
    ) -> Result<TurnOutcome, EngineError> {
        self.resume_inner(request_id, action, Delivery::Streaming(sink))
            .await
    }

    /// Mark a task Failed. For embedders handling unrecoverable errors at
    /// the transport boundary; the engine itself calls this when the turn
    /// guard trips.
    pub async fn mark_failed(&self, task_id: &str, reason: &str) -> Result<(), EngineError> {
        let mut task = self.deps.tasks.load(task_id).await?.ok_or_else(|| {
            crate::error::TaskStoreError::TaskNotFound {
                task_id: task_id.to_string(),
            }
        })?;
        tracing::error!(task_id = %task_id, reason = %reason, "Marking task failed");
        task.set_status(TaskStatus::Failed);
        self.deps.tasks.update(&task).await?;
        Ok(())
    }

    async fn execute_inner(
        &self,
        request: TaskRequest,
        delivery: Delivery,
    ) -> Result<TurnOutcome, EngineError> {
        // Both auth triggers come before any task exists, so a retried call
        // after the OAuth round trip starts the turn loop cleanly.
        if let Some(challenge) = self.preflight_auth().await? {
            return Ok(TurnOutcome::AuthRequired(
                self.challenge_response(challenge, &request.request_id),
            ));
        }

        match self
            .deps
            .discovery
            .ensure_discovered(&request.user_id, &request.session_id)
            .await?
        {
            DiscoveryOutcome::AuthRequired(challenge) => {
                return Ok(TurnOutcome::AuthRequired(
                    self.challenge_response(challenge, &request.request_id),
                ));
            }
            DiscoveryOutcome::Completed { servers, .. } => {
                tracing::debug!(
                    session_id = %request.session_id,
                    servers = servers.len(),
                    "Discovery ready"
                );
            }
        }

        let session_notice = self
            .deps
            .discovery
            .take_status_notice(&request.user_id, &request.session_id)
            .await?;

        let task_id = Uuid::new_v4().to_string();
        let mut task = Task::new(
            task_id.clone(),
            request.session_id.clone(),
            request.user_id.clone(),
        )
        .with_item(TaskItem::user_text(
            &task_id,
            &request.request_id,
            request.prompt.clone(),
        ));
        self.deps.tasks.create(&task).await?;
        tracing::info!(
            task_id = %task_id,
            request_id = %request.request_id,
            user_id = %request.user_id,
            "Task started"
        );

        let history = vec![ChatMessage::user(request.prompt.clone())];
        self.run_turn_loop(
            &mut task,
            &request.request_id,
            &request.settings,
            history,
            &delivery,
            session_notice,
        )
        .await
    }

    async fn resume_inner(
        &self,
        request_id: &str,
        action: ResumeAction,
        delivery: Delivery,
    ) -> Result<TurnOutcome, EngineError> {
        let mut task = self
            .deps
            .tasks
            .load_by_request_id(request_id)
            .await?
            .ok_or_else(|| EngineError::RequestNotFound {
                request_id: request_id.to_string(),
            })?;

        if task.status != TaskStatus::Paused {
            return Err(EngineError::InvalidTaskState {
                task_id: task.task_id.clone(),
                expected: TaskStatus::Paused.to_string(),
                found: task.status.to_string(),
            });
        }

        let pause_item = task
            .last_item()
            .ok_or_else(|| EngineError::CorruptedPauseState {
                task_id: task.task_id.clone(),
                reason: "paused task has no items".into(),
            })?;
        let history =
            pause_item
                .chat_history
                .clone()
                .ok_or_else(|| EngineError::CorruptedPauseState {
                    task_id: task.task_id.clone(),
                    reason: "last item carries no chat history snapshot".into(),
                })?;
        let recorded_mode = pause_item.mode.unwrap_or_default();
        let settings = pause_item.settings.clone().unwrap_or_default();

        tracing::info!(
            task_id = %task.task_id,
            request_id = %request_id,
            action = action.as_str(),
            "Resuming paused task"
        );

        match action {
            ResumeAction::Reject => {
                let task_id = task.task_id.clone();
                task.push_item(TaskItem::rejection_marker(&task_id, request_id));
                task.set_status(TaskStatus::Canceled);
                self.deps.tasks.update(&task).await?;
                Ok(TurnOutcome::Rejected { task_id })
            }
            ResumeAction::Approve => {
                let task_id = task.task_id.clone();
                task.push_item(TaskItem::approval_marker(&task_id, request_id));
                task.set_status(TaskStatus::Running);
                self.deps.tasks.update(&task).await?;

                let pending = task
                    .items
                    .len()
                    .checked_sub(2)
                    .and_then(|i| task.items[i].pending_tool_calls.clone())
                    .ok_or_else(|| EngineError::InvalidTaskState {
                        task_id: task_id.clone(),
                        expected: "pending tool calls on the paused item".into(),
                        found: "none".into(),
                    })?;

                if delivery_mode(&delivery) != recorded_mode {
                    tracing::warn!(
                        task_id = %task_id,
                        recorded = ?recorded_mode,
                        "Resume delivery mode differs from the paused turn's"
                    );
                }

                let mut history = history;
                let results = self.execute_calls(&pending).await?;
                history.extend(results);

                self.run_turn_loop(&mut task, request_id, &settings, history, &delivery, None)
                    .await
            }
        }
    }

    /// Pre-flight credential check: any configured server that requires
    /// auth and has no valid cached credential yields a challenge before a
    /// task is created.
    async fn preflight_auth(&self) -> Result<Option<AuthChallenge>, EngineError> {
        for server in self.deps.discovery.servers() {
            if !server.requires_auth {
                continue;
            }
            let valid = self
                .deps
                .oauth
                .credential(&server.name)
                .await
                .is_some_and(|c| !c.is_expired());
            if !valid {
                tracing::info!(server = %server.name, "No valid credential, issuing auth challenge");
                let challenge = self.deps.oauth.begin_authorization(server).await?;
                return Ok(Some(challenge));
            }
        }
        Ok(None)
    }

    fn challenge_response(
        &self,
        challenge: AuthChallenge,
        request_id: &str,
    ) -> AuthChallengeResponse {
        AuthChallengeResponse {
            challenge,
            resume_url: self.config.resume_url(request_id),
        }
    }

    pub(super) fn pause_descriptor(
        &self,
        task_id: &str,
        request_id: &str,
        pending_calls: Vec<ToolCallRequest>,
    ) -> PauseDescriptor {
        PauseDescriptor {
            task_id: task_id.to_string(),
            request_id: request_id.to_string(),
            approval_url: self.config.resume_action_url(request_id, "approve"),
            rejection_url: self.config.resume_action_url(request_id, "reject"),
            pending_calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_action_round_trips() {
        assert_eq!("approve".parse::<ResumeAction>(), Ok(ResumeAction::Approve));
        assert_eq!("reject".parse::<ResumeAction>(), Ok(ResumeAction::Reject));
        assert!("cancel".parse::<ResumeAction>().is_err());
        assert_eq!(ResumeAction::Approve.as_str(), "approve");
    }
}
