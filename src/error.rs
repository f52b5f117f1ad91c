//! Error types for the task execution core.
//!
//! One enum per domain, plus a top-level [`Error`] that everything converts
//! into at the crate boundary. Control-flow signals (an auth challenge, a
//! pause for approval) are **not** errors — they are variants of
//! [`crate::engine::TurnOutcome`].

use thiserror::Error;

/// Errors from the shared key-value store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation (connection, protocol, type mismatch).
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A record failed to serialize before a write.
    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// An optimistic read-modify-write exhausted its retries.
    #[error("Concurrent update conflict on key '{key}' after {attempts} attempts")]
    Conflict { key: String, attempts: u32 },
}

/// Errors from the task store.
#[derive(Debug, Error)]
pub enum TaskStoreError {
    /// `create` was called for a task id that already exists.
    #[error("Task already exists: {task_id}")]
    DuplicateTask { task_id: String },

    /// The task key is absent.
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// A persisted payload failed to decode or validate. The record has
    /// already been deleted when this error is raised.
    #[error("Corrupted task record at '{key}': {reason}")]
    CorruptedState { key: String, reason: String },

    /// A request id resolved to more than one task in the secondary index.
    #[error("Request index for '{request_id}' resolves to {count} tasks")]
    IndexInconsistent { request_id: String, count: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the discovery store and coordinator.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// `create` was called for a (user, session) pair that already has a record.
    #[error("Discovery record already exists for user '{user_id}' session '{session_id}'")]
    AlreadyExists { user_id: String, session_id: String },

    /// A persisted discovery record failed to decode. The record has been deleted.
    #[error("Corrupted discovery record at '{key}': {reason}")]
    CorruptedState { key: String, reason: String },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the completion service collaborator.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Completion request failed ({provider}): {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Completion response invalid ({provider}): {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Completion stream error: {0}")]
    Stream(String),
}

/// Errors from tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    /// No handle registered for the requested capability.
    #[error("Unknown tool: {plugin}.{function}")]
    NotFound { plugin: String, function: String },

    #[error("Tool '{name}' rejected its arguments: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("Tool '{name}' failed: {reason}")]
    InvocationFailed { name: String, reason: String },
}

/// Errors from the OAuth coordinator collaborator.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authorization setup failed for server '{server}': {reason}")]
    AuthorizationFailed { server: String, reason: String },

    #[error("Token exchange failed for server '{server}': {reason}")]
    ExchangeFailed { server: String, reason: String },
}

/// Errors from the task execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Resume was attempted for a request id with no backing task.
    #[error("No task found for request: {request_id}")]
    RequestNotFound { request_id: String },

    /// Resume was attempted on a task that is not in the expected status,
    /// or a paused task is missing a structural prerequisite.
    #[error("Invalid task state for '{task_id}': expected {expected}, found {found}")]
    InvalidTaskState {
        task_id: String,
        expected: String,
        found: String,
    },

    /// A paused task's last item does not carry the conversation snapshot
    /// needed to resume. The engine does not guess; it fails loudly.
    #[error("Paused task '{task_id}' is missing its pause snapshot: {reason}")]
    CorruptedPauseState { task_id: String, reason: String },

    /// The iterative turn loop exceeded its configured bound.
    #[error("Task '{task_id}' exceeded the turn limit ({limit})")]
    TurnLimitExceeded { task_id: String, limit: usize },

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Task(#[from] TaskStoreError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    TaskStore(#[from] TaskStoreError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
