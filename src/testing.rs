//! Test harness: stub collaborators and a builder wiring them together.
//!
//! Provides:
//! - [`StubCompletion`]: a completion service fed scripted replies
//! - [`RecordingInvoker`]: a tool invoker that records calls and can fail on demand
//! - [`StubTransport`]: a tool-server transport with per-server behavior
//! - [`StubOauth`]: an OAuth coordinator over an in-memory credential map
//! - [`TestHarnessBuilder`]: assembles an engine over a [`MemoryStore`]
//!
//! All defaults work without external services. Use these instead of
//! creating ad-hoc stub implementations in every test.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures::StreamExt;

use crate::auth::{
    AuthChallenge, Credential, OAuthCoordinator, PkceChallenge, build_authorization_url,
};
use crate::config::{RuntimeConfig, ToolServerConfig};
use crate::discovery::{
    ConnectedServer, DiscoveryCoordinator, ToolServerTransport, TransportError,
};
use crate::engine::{EngineDeps, TaskExecutionEngine};
use crate::error::{AuthError, CompletionError, ToolError};
use crate::llm::{
    ChatMessage, CompletionService, CompletionSettings, CompletionStream, MessageContent,
    StreamEvent, ToolCallRequest,
};
use crate::store::{DiscoveryStore, MemoryStore, TaskStore};
use crate::tools::{InterventionPolicy, ToolInvoker};

/// A completion service that replays scripted replies in order.
///
/// When the script runs out it returns a plain "OK" text reply, so a test
/// that only cares about the first turns terminates cleanly.
#[derive(Default)]
pub struct StubCompletion {
    replies: Mutex<VecDeque<Vec<ChatMessage>>>,
    calls: AtomicU32,
}

impl StubCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next reply.
    pub fn push_reply(&self, reply: Vec<ChatMessage>) {
        self.replies.lock().expect("stub lock").push_back(reply);
    }

    /// Queue a plain-text reply.
    pub fn push_text(&self, text: impl Into<String>) {
        self.push_reply(vec![ChatMessage::assistant(text.into())]);
    }

    /// Queue a tool-call reply.
    pub fn push_tool_calls(&self, calls: Vec<ToolCallRequest>) {
        self.push_reply(vec![ChatMessage::tool_calls(calls)]);
    }

    /// Number of completion rounds served (batch + streaming).
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    fn next(&self) -> Vec<ChatMessage> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.replies
            .lock()
            .expect("stub lock")
            .pop_front()
            .unwrap_or_else(|| vec![ChatMessage::assistant("OK")])
    }
}

#[async_trait]
impl CompletionService for StubCompletion {
    async fn complete(
        &self,
        _history: &[ChatMessage],
        _settings: &CompletionSettings,
    ) -> Result<Vec<ChatMessage>, CompletionError> {
        Ok(self.next())
    }

    async fn complete_stream(
        &self,
        _history: &[ChatMessage],
        _settings: &CompletionSettings,
    ) -> Result<CompletionStream, CompletionError> {
        let mut events: Vec<Result<StreamEvent, CompletionError>> = Vec::new();
        for message in self.next() {
            match message.content {
                MessageContent::Text { text } => {
                    // Two chunks per message so tests observe real deltas.
                    let mid = text.len() / 2;
                    let (a, b) = text.split_at(mid);
                    if !a.is_empty() {
                        events.push(Ok(StreamEvent::TextDelta(a.to_string())));
                    }
                    events.push(Ok(StreamEvent::TextDelta(b.to_string())));
                }
                MessageContent::ToolCalls { calls } => {
                    events.push(Ok(StreamEvent::ToolCalls(calls)));
                }
                MessageContent::ToolResult { .. } => {}
            }
        }
        events.push(Ok(StreamEvent::Done));
        Ok(futures::stream::iter(events).boxed())
    }
}

/// A tool invoker that records every call and succeeds with
/// `"<plugin>.<function>: done"` unless told to fail.
#[derive(Default)]
pub struct RecordingInvoker {
    invocations: Mutex<Vec<ToolCallRequest>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make calls to `plugin.function` fail from now on.
    pub fn fail_on(&self, qualified_name: impl Into<String>) {
        self.failing
            .lock()
            .expect("stub lock")
            .insert(qualified_name.into());
    }

    /// Every call seen so far, in invocation order.
    pub fn invocations(&self) -> Vec<ToolCallRequest> {
        self.invocations.lock().expect("stub lock").clone()
    }
}

#[async_trait]
impl ToolInvoker for RecordingInvoker {
    async fn invoke(&self, call: &ToolCallRequest) -> Result<String, ToolError> {
        self.invocations.lock().expect("stub lock").push(call.clone());
        let name = call.qualified_name();
        if self.failing.lock().expect("stub lock").contains(&name) {
            return Err(ToolError::InvocationFailed {
                name,
                reason: "stubbed failure".into(),
            });
        }
        Ok(format!("{}: done", name))
    }
}

/// A tool-server transport with per-server scripted behavior.
#[derive(Default)]
pub struct StubTransport {
    auth_required: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    connects: Mutex<Vec<String>>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a server demand authentication.
    pub fn require_auth(&self, server_name: impl Into<String>) {
        self.auth_required
            .lock()
            .expect("stub lock")
            .insert(server_name.into());
    }

    /// Stop a server from demanding authentication (post-OAuth).
    pub fn clear_auth(&self, server_name: &str) {
        self.auth_required
            .lock()
            .expect("stub lock")
            .remove(server_name);
    }

    /// Make a server fail to connect.
    pub fn fail_on(&self, server_name: impl Into<String>) {
        self.failing
            .lock()
            .expect("stub lock")
            .insert(server_name.into());
    }

    /// Server names connected so far, in order.
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().expect("stub lock").clone()
    }
}

#[async_trait]
impl ToolServerTransport for StubTransport {
    async fn connect(&self, server: &ToolServerConfig) -> Result<ConnectedServer, TransportError> {
        self.connects
            .lock()
            .expect("stub lock")
            .push(server.name.clone());
        if self
            .auth_required
            .lock()
            .expect("stub lock")
            .contains(&server.name)
        {
            return Err(TransportError::AuthRequired {
                auth_server: format!("https://auth.example.com/{}", server.name),
                scopes: server.scopes.clone(),
            });
        }
        if self.failing.lock().expect("stub lock").contains(&server.name) {
            return Err(TransportError::Failed("stubbed connection failure".into()));
        }
        Ok(ConnectedServer {
            session_id: format!("sess-{}", server.name),
            tool_names: vec![format!("{}_tool", server.name)],
        })
    }
}

/// An OAuth coordinator over an in-memory credential map.
#[derive(Default)]
pub struct StubOauth {
    credentials: Mutex<HashMap<String, Credential>>,
}

impl StubOauth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a non-expiring credential for a server.
    pub fn grant(&self, server_name: impl Into<String>) {
        self.credentials.lock().expect("stub lock").insert(
            server_name.into(),
            Credential {
                access_token: secrecy::SecretString::from("stub-token"),
                refresh_token: None,
                expires_at: None,
                scopes: Vec::new(),
            },
        );
    }
}

#[async_trait]
impl OAuthCoordinator for StubOauth {
    async fn begin_authorization(
        &self,
        server: &ToolServerConfig,
    ) -> Result<AuthChallenge, AuthError> {
        let pkce = PkceChallenge::generate();
        let auth_server = format!("https://auth.example.com/{}", server.name);
        let auth_url = build_authorization_url(
            &format!("{}/authorize", auth_server),
            "taskhelm-test",
            "https://agent.example.com/oauth/callback",
            &server.scopes,
            &pkce,
        );
        Ok(AuthChallenge {
            server_name: server.name.clone(),
            auth_server,
            scopes: server.scopes.clone(),
            auth_url,
        })
    }

    async fn exchange_code(
        &self,
        server_name: &str,
        _code: &str,
    ) -> Result<Credential, AuthError> {
        self.grant(server_name);
        self.credentials
            .lock()
            .expect("stub lock")
            .get(server_name)
            .cloned()
            .ok_or_else(|| AuthError::ExchangeFailed {
                server: server_name.into(),
                reason: "no credential".into(),
            })
    }

    async fn credential(&self, server_name: &str) -> Option<Credential> {
        self.credentials
            .lock()
            .expect("stub lock")
            .get(server_name)
            .cloned()
    }
}

/// Assembled test components.
pub struct TestHarness {
    pub engine: TaskExecutionEngine,
    pub shared: Arc<MemoryStore>,
    pub tasks: Arc<TaskStore>,
    pub completion: Arc<StubCompletion>,
    pub invoker: Arc<RecordingInvoker>,
    pub transport: Arc<StubTransport>,
    pub oauth: Arc<StubOauth>,
    pub config: RuntimeConfig,
}

impl TestHarness {
    /// A discovery store view over the same shared store, for assertions.
    pub fn discovery_store(&self) -> DiscoveryStore {
        DiscoveryStore::new(
            self.shared.clone(),
            self.config.discovery_ttl,
            self.config.cas_max_retries,
        )
    }

    /// A tool server config pointing at the stub transport.
    pub fn server(name: &str) -> ToolServerConfig {
        ToolServerConfig {
            name: name.into(),
            endpoint: url::Url::parse("https://tools.example.com/").expect("static url parses"),
            scopes: vec!["tools".into()],
            requires_auth: false,
        }
    }
}

/// Builder for a [`TestHarness`] with sensible defaults: memory store, no
/// tool servers, everything auto-approved.
#[derive(Default)]
pub struct TestHarnessBuilder {
    servers: Vec<ToolServerConfig>,
    policy: Option<InterventionPolicy>,
    config: Option<RuntimeConfig>,
    shared: Option<Arc<MemoryStore>>,
}

impl TestHarnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, server: ToolServerConfig) -> Self {
        self.servers.push(server);
        self
    }

    /// Share a store with another harness, simulating a second service
    /// instance over the same backing state.
    pub fn with_shared(mut self, shared: Arc<MemoryStore>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn with_policy(mut self, policy: InterventionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> TestHarness {
        let config = self.config.unwrap_or_default();
        let shared = self.shared.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let tasks = Arc::new(TaskStore::new(shared.clone(), config.task_ttl));
        let completion = Arc::new(StubCompletion::new());
        let invoker = Arc::new(RecordingInvoker::new());
        let transport = Arc::new(StubTransport::new());
        let oauth = Arc::new(StubOauth::new());

        let discovery = Arc::new(DiscoveryCoordinator::new(
            DiscoveryStore::new(shared.clone(), config.discovery_ttl, config.cas_max_retries),
            transport.clone(),
            oauth.clone(),
            self.servers,
        ));

        let deps = EngineDeps {
            completion: completion.clone(),
            invoker: invoker.clone(),
            tasks: tasks.clone(),
            discovery,
            oauth: oauth.clone(),
        };

        let engine =
            TaskExecutionEngine::new(deps, self.policy.unwrap_or_default(), config.clone());

        TestHarness {
            engine,
            shared,
            tasks,
            completion,
            invoker,
            transport,
            oauth,
            config,
        }
    }
}

/// A tool-call request literal for tests.
pub fn tool_call(id: &str, plugin: &str, function: &str) -> ToolCallRequest {
    ToolCallRequest {
        call_id: id.into(),
        plugin: plugin.into(),
        function: function.into(),
        arguments: serde_json::json!({}),
    }
}
