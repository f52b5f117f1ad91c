//! Per-(user, session) discovery record.
//!
//! A single JSON value at `mcp_state:{user_id}:{session_id}` holds all
//! session-scoped discovery state, including transient flags like "has the
//! status notice been shown" — those must live here, not in process memory,
//! so they stay correct across replicas and restarts.
//!
//! Every mutation is an optimistic read-modify-write: read, apply, then
//! compare-and-swap against the exact prior payload, retrying on conflict.
//! Two instances can therefore never clobber each other's field updates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, StoreError};
use crate::store::{SharedStore, discovery_key};

/// Failure reasons are truncated to this many characters before storage.
const MAX_FAILURE_REASON: usize = 256;

/// Bookkeeping for one connected tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSession {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl ServerSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            created_at: now,
            last_used_at: now,
        }
    }
}

/// The discovery record for one (user, session) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryState {
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub servers: HashMap<String, ServerSession>,
    #[serde(default)]
    pub discovery_completed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub failed_servers: HashMap<String, String>,
    #[serde(default)]
    pub status_notice_shown: bool,
}

impl DiscoveryState {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            servers: HashMap::new(),
            discovery_completed: false,
            created_at: Utc::now(),
            failed_servers: HashMap::new(),
            status_notice_shown: false,
        }
    }
}

/// What a mutation closure decided to do with the record.
enum Mutation<T> {
    /// Write the modified record back.
    Write(DiscoveryState, T),
    /// Leave the stored record untouched.
    Skip(T),
}

/// Store for discovery records, backed by the shared key-value store.
pub struct DiscoveryStore {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
    cas_max_retries: u32,
}

impl DiscoveryStore {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration, cas_max_retries: u32) -> Self {
        Self {
            store,
            ttl,
            cas_max_retries,
        }
    }

    /// Load the record. Deletes and reports a payload that fails to decode.
    pub async fn load(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<DiscoveryState>, DiscoveryError> {
        let key = discovery_key(user_id, session_id);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(self.decode(&key, &raw).await?)),
            None => Ok(None),
        }
    }

    /// Insert a fresh record. Fails if one already exists — a concurrent
    /// instance winning this race is normal, and callers treat it as success.
    pub async fn create(&self, state: &DiscoveryState) -> Result<(), DiscoveryError> {
        let key = discovery_key(&state.user_id, &state.session_id);
        let raw = serde_json::to_string(state).map_err(StoreError::from)?;
        if !self.store.put_if_absent(&key, &raw, self.ttl).await? {
            return Err(DiscoveryError::AlreadyExists {
                user_id: state.user_id.clone(),
                session_id: state.session_id.clone(),
            });
        }
        tracing::debug!(user_id = %state.user_id, session_id = %state.session_id, "Discovery record created");
        Ok(())
    }

    /// Whether discovery has completed for this session.
    pub async fn is_completed(&self, user_id: &str, session_id: &str) -> Result<bool, DiscoveryError> {
        Ok(self
            .load(user_id, session_id)
            .await?
            .is_some_and(|s| s.discovery_completed))
    }

    /// Flip `discovery_completed`. If the record has gone missing by this
    /// late stage, auto-create a completed, empty-server record rather than
    /// failing the caller.
    pub async fn mark_completed(&self, user_id: &str, session_id: &str) -> Result<(), DiscoveryError> {
        self.mutate(user_id, session_id, |state| {
            let mut state = match state {
                Some(state) => state,
                None => {
                    tracing::warn!(
                        user_id = %user_id,
                        session_id = %session_id,
                        "Discovery record missing at completion, auto-creating"
                    );
                    DiscoveryState::new(user_id, session_id)
                }
            };
            if state.discovery_completed {
                return Mutation::Skip(());
            }
            state.discovery_completed = true;
            Mutation::Write(state, ())
        })
        .await
    }

    /// Record (or replace) the session for a server.
    pub async fn store_session(
        &self,
        user_id: &str,
        session_id: &str,
        server_name: &str,
        server_session_id: &str,
    ) -> Result<(), DiscoveryError> {
        self.mutate(user_id, session_id, |state| {
            let mut state = state.unwrap_or_else(|| DiscoveryState::new(user_id, session_id));
            state
                .servers
                .insert(server_name.to_string(), ServerSession::new(server_session_id));
            state.failed_servers.remove(server_name);
            Mutation::Write(state, ())
        })
        .await
    }

    /// The stored session for a server, if any.
    pub async fn get_session(
        &self,
        user_id: &str,
        session_id: &str,
        server_name: &str,
    ) -> Result<Option<ServerSession>, DiscoveryError> {
        Ok(self
            .load(user_id, session_id)
            .await?
            .and_then(|s| s.servers.get(server_name).cloned()))
    }

    /// Bump `last_used_at` for a server's session. No-op when the record or
    /// the server entry is missing.
    pub async fn update_last_used(
        &self,
        user_id: &str,
        session_id: &str,
        server_name: &str,
    ) -> Result<(), DiscoveryError> {
        self.mutate(user_id, session_id, |state| {
            let Some(mut state) = state else {
                return Mutation::Skip(());
            };
            if let Some(session) = state.servers.get_mut(server_name) {
                session.last_used_at = Utc::now();
            } else {
                return Mutation::Skip(());
            }
            Mutation::Write(state, ())
        })
        .await
    }

    /// Drop a server's session. When `expected_session_id` is given and the
    /// stored session has since changed, this is a no-op — another instance
    /// just refreshed it, and clobbering that would be a race.
    pub async fn clear_session(
        &self,
        user_id: &str,
        session_id: &str,
        server_name: &str,
        expected_session_id: Option<&str>,
    ) -> Result<(), DiscoveryError> {
        self.mutate(user_id, session_id, |state| {
            let Some(mut state) = state else {
                return Mutation::Skip(());
            };
            let Some(current) = state.servers.get(server_name) else {
                return Mutation::Skip(());
            };
            if let Some(expected) = expected_session_id
                && current.session_id != expected
            {
                tracing::debug!(
                    server = %server_name,
                    "Session changed since clear was requested, leaving it"
                );
                return Mutation::Skip(());
            }
            state.servers.remove(server_name);
            Mutation::Write(state, ())
        })
        .await
    }

    /// Record a truncated failure reason for one server without failing the
    /// rest of the session.
    pub async fn record_failure(
        &self,
        user_id: &str,
        session_id: &str,
        server_name: &str,
        reason: &str,
    ) -> Result<(), DiscoveryError> {
        let reason = truncate_reason(reason);
        self.mutate(user_id, session_id, move |state| {
            let mut state = state.unwrap_or_else(|| DiscoveryState::new(user_id, session_id));
            state
                .failed_servers
                .insert(server_name.to_string(), reason.clone());
            Mutation::Write(state, ())
        })
        .await
    }

    /// Atomically test-and-set the "status notice shown" flag. Returns true
    /// exactly once per session; false when the flag was already set or no
    /// record exists yet.
    pub async fn take_status_notice(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<bool, DiscoveryError> {
        self.mutate(user_id, session_id, |state| {
            let Some(mut state) = state else {
                return Mutation::Skip(false);
            };
            if state.status_notice_shown {
                return Mutation::Skip(false);
            }
            state.status_notice_shown = true;
            Mutation::Write(state, true)
        })
        .await
    }

    /// Optimistic read-modify-write against the record, retried on CAS
    /// conflict up to the configured budget.
    async fn mutate<T, F>(
        &self,
        user_id: &str,
        session_id: &str,
        apply: F,
    ) -> Result<T, DiscoveryError>
    where
        F: Fn(Option<DiscoveryState>) -> Mutation<T>,
    {
        let key = discovery_key(user_id, session_id);

        for attempt in 0..self.cas_max_retries {
            let raw = self.store.get(&key).await?;
            let state = match &raw {
                Some(raw) => Some(self.decode(&key, raw).await?),
                None => None,
            };

            let new_state = match apply(state) {
                Mutation::Skip(value) => return Ok(value),
                Mutation::Write(new_state, value) => (new_state, value),
            };

            let new_raw = serde_json::to_string(&new_state.0).map_err(StoreError::from)?;
            if self
                .store
                .compare_and_swap(&key, raw.as_deref(), &new_raw, self.ttl)
                .await?
            {
                return Ok(new_state.1);
            }
            tracing::debug!(key = %key, attempt, "Discovery CAS conflict, retrying");
        }

        Err(StoreError::Conflict {
            key,
            attempts: self.cas_max_retries,
        }
        .into())
    }

    async fn decode(&self, key: &str, raw: &str) -> Result<DiscoveryState, DiscoveryError> {
        match serde_json::from_str::<DiscoveryState>(raw) {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!(key = %key, reason = %e, "Corrupted discovery record, deleting");
                self.store.delete(key).await?;
                Err(DiscoveryError::CorruptedState {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.chars().count() <= MAX_FAILURE_REASON {
        reason.to_string()
    } else {
        reason.chars().take(MAX_FAILURE_REASON).collect()
    }
}
