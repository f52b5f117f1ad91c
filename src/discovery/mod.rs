//! One-time-per-session tool-server discovery.
//!
//! Discovery connects to every configured tool server once per (user,
//! session) pair, records a per-server session, and marks the session
//! discovered. Multiple service instances may attempt this concurrently;
//! all coordination happens through the atomic discovery record, so the
//! work converges to exactly one completed discovery with no lost updates.
//!
//! A server that fails is recorded and skipped — one bad server never takes
//! down the session. A server that demands authentication halts discovery
//! with an [`AuthChallenge`] instead: the session stays un-discovered, and
//! the next invocation retries from scratch (already-connected servers are
//! reused through their stored sessions).

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::auth::{AuthChallenge, OAuthCoordinator};
use crate::config::ToolServerConfig;
use crate::error::DiscoveryError;
use crate::store::DiscoveryStore;

/// The result of connecting to one tool server.
#[derive(Debug, Clone)]
pub struct ConnectedServer {
    /// Server-assigned session id.
    pub session_id: String,
    /// Tools the server advertises.
    pub tool_names: Vec<String>,
}

/// Errors from the tool-server transport collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server demands an OAuth round trip before it will talk.
    #[error("Server requires authentication via {auth_server}")]
    AuthRequired {
        auth_server: String,
        scopes: Vec<String>,
    },

    /// Anything else: unreachable, handshake failure, protocol error.
    #[error("Connection failed: {0}")]
    Failed(String),
}

/// External collaborator: the wire-level client for one tool server.
#[async_trait]
pub trait ToolServerTransport: Send + Sync {
    async fn connect(&self, server: &ToolServerConfig) -> Result<ConnectedServer, TransportError>;
}

/// Outcome of an `ensure_discovered` call.
#[derive(Debug, Clone)]
pub enum DiscoveryOutcome {
    /// Discovery is complete for this session.
    Completed {
        /// Names of servers with a live session.
        servers: Vec<String>,
        /// Whether this call performed the discovery (vs. found it done).
        newly_completed: bool,
    },
    /// A server demanded authentication; discovery did not complete.
    AuthRequired(AuthChallenge),
}

/// Coordinates once-per-session discovery across service instances.
pub struct DiscoveryCoordinator {
    store: DiscoveryStore,
    transport: Arc<dyn ToolServerTransport>,
    oauth: Arc<dyn OAuthCoordinator>,
    servers: Vec<ToolServerConfig>,
}

impl DiscoveryCoordinator {
    pub fn new(
        store: DiscoveryStore,
        transport: Arc<dyn ToolServerTransport>,
        oauth: Arc<dyn OAuthCoordinator>,
        servers: Vec<ToolServerConfig>,
    ) -> Self {
        Self {
            store,
            transport,
            oauth,
            servers,
        }
    }

    /// The configured tool servers.
    pub fn servers(&self) -> &[ToolServerConfig] {
        &self.servers
    }

    /// Run discovery for the session unless it already completed.
    ///
    /// Idempotent and safe under concurrency: the record is created with a
    /// create-if-absent write (losing that race is fine), per-server results
    /// land via atomic field updates, and completion is a single atomic
    /// flip. Re-running after an auth round trip reuses stored per-server
    /// sessions, so already-discovered servers are not contacted again.
    pub async fn ensure_discovered(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<DiscoveryOutcome, DiscoveryError> {
        if self.store.is_completed(user_id, session_id).await? {
            let servers = self.connected_servers(user_id, session_id).await?;
            return Ok(DiscoveryOutcome::Completed {
                servers,
                newly_completed: false,
            });
        }

        match self
            .store
            .create(&crate::store::DiscoveryState::new(user_id, session_id))
            .await
        {
            Ok(()) => {}
            Err(DiscoveryError::AlreadyExists { .. }) => {
                // Another instance created it first; fall through and share it.
            }
            Err(e) => return Err(e),
        }

        for server in &self.servers {
            if let Some(session) = self
                .store
                .get_session(user_id, session_id, &server.name)
                .await?
            {
                tracing::debug!(
                    server = %server.name,
                    server_session = %session.session_id,
                    "Reusing existing server session"
                );
                self.store
                    .update_last_used(user_id, session_id, &server.name)
                    .await?;
                continue;
            }

            match self.transport.connect(server).await {
                Ok(connected) => {
                    tracing::info!(
                        server = %server.name,
                        tools = connected.tool_names.len(),
                        "Discovered tool server"
                    );
                    self.store
                        .store_session(user_id, session_id, &server.name, &connected.session_id)
                        .await?;
                }
                Err(TransportError::AuthRequired {
                    auth_server,
                    scopes,
                }) => {
                    tracing::info!(
                        server = %server.name,
                        auth_server = %auth_server,
                        "Server demands authentication, halting discovery"
                    );
                    let mut challenge = self.oauth.begin_authorization(server).await?;
                    if challenge.auth_server.is_empty() {
                        challenge.auth_server = auth_server;
                    }
                    if challenge.scopes.is_empty() {
                        challenge.scopes = scopes;
                    }
                    return Ok(DiscoveryOutcome::AuthRequired(challenge));
                }
                Err(TransportError::Failed(reason)) => {
                    tracing::warn!(
                        server = %server.name,
                        reason = %reason,
                        "Tool server discovery failed, continuing with others"
                    );
                    self.store
                        .record_failure(user_id, session_id, &server.name, &reason)
                        .await?;
                }
            }
        }

        self.store.mark_completed(user_id, session_id).await?;
        let servers = self.connected_servers(user_id, session_id).await?;
        Ok(DiscoveryOutcome::Completed {
            servers,
            newly_completed: true,
        })
    }

    /// The one-time session status notice, if it has not been shown yet.
    /// Backed by the store, so exactly one replica shows it.
    pub async fn take_status_notice(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<String>, DiscoveryError> {
        if self.servers.is_empty() {
            return Ok(None);
        }
        if !self.store.take_status_notice(user_id, session_id).await? {
            return Ok(None);
        }
        let servers = self.connected_servers(user_id, session_id).await?;
        if servers.is_empty() {
            return Ok(Some("No external tool servers are connected.".to_string()));
        }
        Ok(Some(format!(
            "Connected to {} tool server(s): {}",
            servers.len(),
            servers.join(", ")
        )))
    }

    async fn connected_servers(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Vec<String>, DiscoveryError> {
        let mut names: Vec<String> = self
            .store
            .load(user_id, session_id)
            .await?
            .map(|state| state.servers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }
}
