//! Resumable task execution core for AI-agent runtimes.
//!
//! Drives a multi-turn reasoning + tool-call loop on behalf of a user task,
//! persists task state so it survives restarts and horizontal scale-out,
//! pauses turns for human approval of risky tool calls and resumes them
//! later, and performs once-per-session discovery of external tool servers
//! (including the OAuth challenge round trip some of them require).
//!
//! The language-model client, the tool executors, the tool-server wire
//! protocol, the OAuth token machinery, and the transport layer are all
//! external collaborators — this crate defines their contracts
//! ([`llm::CompletionService`], [`tools::ToolInvoker`],
//! [`discovery::ToolServerTransport`], [`auth::OAuthCoordinator`]) and owns
//! everything between them: the state machine, the stores, and the
//! coordination rules that keep multiple service instances from racing.

pub mod auth;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod llm;
pub mod model;
pub mod store;
pub mod testing;
pub mod tools;

pub use config::{RuntimeConfig, ToolServerConfig};
pub use engine::{
    Delivery, EngineDeps, PauseDescriptor, ResumeAction, TaskExecutionEngine, TaskRequest,
    TurnOutcome,
};
pub use error::Error;
pub use model::{Task, TaskItem, TaskStatus};
