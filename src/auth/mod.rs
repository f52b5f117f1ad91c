//! OAuth contract and PKCE helpers.
//!
//! The authorization round trip itself (token endpoint calls, credential
//! persistence) lives outside this crate behind [`OAuthCoordinator`]. This
//! module defines the challenge payload the engine surfaces to callers, the
//! PKCE material generator, and the credential shape the cache hands back.
//!
//! Tokens are wrapped in [`SecretString`] so they never leak through
//! `Debug` output or logs.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use async_trait::async_trait;

use crate::config::ToolServerConfig;
use crate::error::AuthError;

/// Expiry skew applied when judging whether a credential is still usable.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Surfaced to the caller when a tool server demands authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthChallenge {
    /// The tool server that demanded authentication.
    pub server_name: String,
    /// The authorization server endpoint.
    pub auth_server: String,
    /// Scopes the server requires.
    pub scopes: Vec<String>,
    /// Fully-formed authorization URL the user should visit.
    pub auth_url: String,
}

/// Engine-level challenge response: the challenge plus where to re-enter
/// the original request once authorization completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthChallengeResponse {
    #[serde(flatten)]
    pub challenge: AuthChallenge,
    pub resume_url: String,
}

/// A cached credential for one tool server.
#[derive(Clone)]
pub struct Credential {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

impl Credential {
    /// Whether the credential is past (or within a minute of) expiry.
    /// Credentials without an expiry never expire.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                Utc::now() + ChronoDuration::seconds(EXPIRY_SKEW_SECS) >= expires_at
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// External collaborator: issues PKCE authorization URLs and exchanges
/// authorization codes for tokens.
#[async_trait]
pub trait OAuthCoordinator: Send + Sync {
    /// Start an authorization round trip for a server, returning the
    /// challenge the caller should surface to the user.
    async fn begin_authorization(
        &self,
        server: &ToolServerConfig,
    ) -> Result<AuthChallenge, AuthError>;

    /// Exchange an authorization code for a credential.
    async fn exchange_code(&self, server_name: &str, code: &str)
    -> Result<Credential, AuthError>;

    /// A cached credential for the server, if one exists. Callers still
    /// check [`Credential::is_expired`].
    async fn credential(&self, server_name: &str) -> Option<Credential>;
}

/// PKCE material for one authorization attempt (RFC 7636, S256).
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// The code verifier — kept by the coordinator for the token exchange.
    pub verifier: String,
    /// base64url(SHA-256(verifier)), sent with the authorization request.
    pub challenge: String,
    /// Opaque state parameter tying the callback to this attempt.
    pub state: String,
}

impl PkceChallenge {
    /// Generate fresh PKCE material from OS randomness.
    pub fn generate() -> Self {
        let verifier = random_urlsafe(32);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
            state: random_urlsafe(16),
        }
    }
}

/// `len` random bytes, base64url-encoded without padding.
fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(bytes.as_mut_slice());
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Assemble an authorization-code-with-PKCE URL.
pub fn build_authorization_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    pkce: &PkceChallenge,
) -> String {
    let scope = scopes.join(" ");
    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256",
        auth_endpoint,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(&scope),
        urlencoding::encode(&pkce.state),
        urlencoding::encode(&pkce.challenge),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkce_challenge_matches_verifier() {
        let pkce = PkceChallenge::generate();
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pkce.verifier.as_bytes()));
        assert_eq!(pkce.challenge, expected);
        // base64url alphabet only, no padding.
        assert!(!pkce.challenge.contains('='));
        assert!(!pkce.verifier.is_empty());
    }

    #[test]
    fn test_pkce_material_is_random() {
        let a = PkceChallenge::generate();
        let b = PkceChallenge::generate();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.state, b.state);
    }

    #[test]
    fn test_authorization_url_shape() {
        let pkce = PkceChallenge::generate();
        let url = build_authorization_url(
            "https://auth.example.com/authorize",
            "client-1",
            "https://agent.example.com/oauth/callback",
            &["read".to_string(), "write".to_string()],
            &pkce,
        );

        assert!(url.starts_with("https://auth.example.com/authorize?response_type=code"));
        assert!(url.contains("scope=read%20write"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("state={}", pkce.state)));
    }

    #[test]
    fn test_credential_expiry_with_skew() {
        let fresh = Credential {
            access_token: SecretString::from("token"),
            refresh_token: None,
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            scopes: vec![],
        };
        assert!(!fresh.is_expired());

        let nearly = Credential {
            expires_at: Some(Utc::now() + ChronoDuration::seconds(30)),
            ..fresh.clone()
        };
        assert!(nearly.is_expired());

        let forever = Credential {
            expires_at: None,
            ..fresh
        };
        assert!(!forever.is_expired());
    }

    #[test]
    fn test_credential_debug_redacts_token() {
        let cred = Credential {
            access_token: SecretString::from("super-secret"),
            refresh_token: None,
            expires_at: None,
            scopes: vec!["read".into()],
        };
        let debug = format!("{:?}", cred);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn test_challenge_response_flattens() {
        let response = AuthChallengeResponse {
            challenge: AuthChallenge {
                server_name: "search".into(),
                auth_server: "https://auth.example.com".into(),
                scopes: vec!["read".into()],
                auth_url: "https://auth.example.com/authorize?x=1".into(),
            },
            resume_url: "/resume/r-1".into(),
        };
        let json = serde_json::to_value(&response).expect("serialize");
        assert_eq!(json["server_name"], "search");
        assert_eq!(json["resume_url"], "/resume/r-1");
    }
}
