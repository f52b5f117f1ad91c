//! Runtime configuration.
//!
//! Loading (files, env) is the embedder's job; this module only defines the
//! shapes the core consumes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Default TTL for persisted task and discovery records.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Engine-level knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// TTL applied to task records, refreshed on every write.
    pub task_ttl: Duration,
    /// TTL applied to discovery records, refreshed on every write.
    pub discovery_ttl: Duration,
    /// Upper bound on turns per request. Exceeding it fails the task
    /// instead of looping forever.
    pub max_turns: usize,
    /// Prefix for approval/rejection/resume URLs handed back to callers.
    /// Empty means relative URLs.
    pub resume_base_url: String,
    /// Retry budget for optimistic read-modify-write loops against the
    /// shared store.
    pub cas_max_retries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            task_ttl: DEFAULT_RECORD_TTL,
            discovery_ttl: DEFAULT_RECORD_TTL,
            max_turns: 32,
            resume_base_url: String::new(),
            cas_max_retries: 16,
        }
    }
}

impl RuntimeConfig {
    /// `{base}/resume/{request_id}` — where a caller re-enters a paused or
    /// auth-challenged request.
    pub fn resume_url(&self, request_id: &str) -> String {
        format!(
            "{}/resume/{}",
            self.resume_base_url,
            urlencoding::encode(request_id)
        )
    }

    /// Resume URL with an explicit action query parameter.
    pub fn resume_action_url(&self, request_id: &str, action: &str) -> String {
        format!("{}?action={}", self.resume_url(request_id), action)
    }
}

/// One externally-reachable tool server the runtime should discover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    /// Stable server name, used as the key in discovery bookkeeping.
    pub name: String,
    /// Server endpoint.
    pub endpoint: Url,
    /// OAuth scopes required when the server demands authentication.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Whether the server is known to require a credential up front.
    /// Servers may still demand authentication mid-discovery regardless.
    #[serde(default)]
    pub requires_auth: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.task_ttl, Duration::from_secs(86_400));
        assert_eq!(config.max_turns, 32);
        assert!(config.resume_base_url.is_empty());
    }

    #[test]
    fn test_resume_urls() {
        let config = RuntimeConfig {
            resume_base_url: "https://agent.example.com".into(),
            ..Default::default()
        };
        assert_eq!(
            config.resume_action_url("req-1", "approve"),
            "https://agent.example.com/resume/req-1?action=approve"
        );
        assert_eq!(
            RuntimeConfig::default().resume_url("req-1"),
            "/resume/req-1"
        );
    }

    #[test]
    fn test_tool_server_config_deserializes_with_defaults() {
        let config: ToolServerConfig = serde_json::from_value(serde_json::json!({
            "name": "search",
            "endpoint": "https://tools.example.com/search"
        }))
        .expect("deserialize");
        assert_eq!(config.name, "search");
        assert!(config.scopes.is_empty());
        assert!(!config.requires_auth);
    }
}
