//! Upstream authentication policies.
//!
//! Static policies (bearer/api-key/basic/custom headers) turn into request
//! headers; OAuth 2.0 authorization-code with PKCE additionally holds token
//! state and supports a single refresh attempt on 401.

use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use crate::upstream::error::{UpstreamError, UpstreamResult};

#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthPolicy {
    #[default]
    None,
    Bearer {
        token: String,
    },
    ApiKey {
        header: String,
        key: String,
    },
    Basic {
        username: String,
        password: String,
    },
    Headers {
        headers: HashMap<String, String>,
    },
    Oauth(OauthConfig),
}

impl std::fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthPolicy::None => write!(f, "None"),
            AuthPolicy::Bearer { .. } => write!(f, "Bearer(****)"),
            AuthPolicy::ApiKey { header, .. } => {
                f.debug_struct("ApiKey").field("header", header).finish()
            }
            AuthPolicy::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish(),
            AuthPolicy::Headers { headers } => f
                .debug_struct("Headers")
                .field("count", &headers.len())
                .finish(),
            AuthPolicy::Oauth(cfg) => f
                .debug_struct("Oauth")
                .field("client_id", &cfg.client_id)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthConfig {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// PKCE verifier/challenge pair plus the CSRF state for one pending flow.
#[derive(Debug, Clone)]
pub struct PkceFlow {
    pub verifier: String,
    pub state: String,
}

/// S256 code challenge: base64url(sha256(verifier)), no padding.
pub fn pkce_s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Mutable authentication state for one upstream session.
pub struct AuthState {
    policy: AuthPolicy,
    tokens: Mutex<Option<OauthTokens>>,
    pending: Mutex<Option<PkceFlow>>,
}

impl AuthState {
    pub fn new(policy: AuthPolicy) -> Self {
        Self {
            policy,
            tokens: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    pub fn with_tokens(policy: AuthPolicy, tokens: Option<OauthTokens>) -> Self {
        Self {
            policy,
            tokens: Mutex::new(tokens),
            pending: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &AuthPolicy {
        &self.policy
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self.policy, AuthPolicy::Oauth(_))
    }

    pub fn tokens(&self) -> Option<OauthTokens> {
        self.tokens.lock().clone()
    }

    /// Drop all stored tokens and any pending flow.
    pub fn clear(&self) {
        *self.tokens.lock() = None;
        *self.pending.lock() = None;
    }

    /// Apply the policy to an outgoing header map. Existing Authorization
    /// headers win so per-server header overrides stay authoritative.
    pub fn apply(&self, headers: &mut HeaderMap) -> UpstreamResult<()> {
        match &self.policy {
            AuthPolicy::None => {}
            AuthPolicy::Bearer { token } => {
                insert_if_absent(headers, AUTHORIZATION, &format!("Bearer {}", token))?;
            }
            AuthPolicy::ApiKey { header, key } => {
                let name = HeaderName::from_bytes(header.as_bytes()).map_err(|_| {
                    UpstreamError::Config(format!("invalid auth header name: {}", header))
                })?;
                let value = HeaderValue::from_str(key)
                    .map_err(|_| UpstreamError::Config("invalid api key value".to_string()))?;
                headers.entry(name).or_insert(value);
            }
            AuthPolicy::Basic { username, password } => {
                let raw = format!("{}:{}", username, password);
                let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
                insert_if_absent(headers, AUTHORIZATION, &format!("Basic {}", encoded))?;
            }
            AuthPolicy::Headers {
                headers: extra_headers,
            } => {
                for (key, value) in extra_headers {
                    let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
                        UpstreamError::Config(format!("invalid auth header name: {}", key))
                    })?;
                    let header_value = HeaderValue::from_str(value).map_err(|_| {
                        UpstreamError::Config(format!("invalid auth header value for {}", key))
                    })?;
                    headers.entry(name).or_insert(header_value);
                }
            }
            AuthPolicy::Oauth(_) => {
                if let Some(tokens) = self.tokens.lock().as_ref() {
                    insert_if_absent(
                        headers,
                        AUTHORIZATION,
                        &format!("Bearer {}", tokens.access_token),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Build the authorization URL for a fresh PKCE flow, remembering the
    /// verifier so `complete_authorization` can finish the exchange.
    pub fn begin_authorization(&self) -> UpstreamResult<String> {
        let AuthPolicy::Oauth(cfg) = &self.policy else {
            return Err(UpstreamError::Config(
                "server is not configured for oauth".to_string(),
            ));
        };

        let flow = PkceFlow {
            verifier: random_token(64),
            state: random_token(24),
        };
        let challenge = pkce_s256(&flow.verifier);

        let mut url = Url::parse(&cfg.authorization_endpoint)
            .map_err(|e| UpstreamError::Config(format!("bad authorization endpoint: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &cfg.client_id)
            .append_pair("redirect_uri", &cfg.redirect_uri)
            .append_pair("state", &flow.state)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256");
        if !cfg.scopes.is_empty() {
            url.query_pairs_mut()
                .append_pair("scope", &cfg.scopes.join(" "));
        }

        *self.pending.lock() = Some(flow);
        Ok(url.to_string())
    }

    /// Exchange an authorization code for tokens (PKCE completion).
    pub async fn complete_authorization(
        &self,
        http: &reqwest::Client,
        code: &str,
    ) -> UpstreamResult<()> {
        let AuthPolicy::Oauth(cfg) = &self.policy else {
            return Err(UpstreamError::Config(
                "server is not configured for oauth".to_string(),
            ));
        };
        let Some(flow) = self.pending.lock().take() else {
            return Err(UpstreamError::Config(
                "no pending authorization flow".to_string(),
            ));
        };

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", cfg.redirect_uri.clone()),
            ("client_id", cfg.client_id.clone()),
            ("code_verifier", flow.verifier),
        ];
        if let Some(secret) = &cfg.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let tokens = request_tokens(http, &cfg.token_endpoint, &form).await?;
        *self.tokens.lock() = Some(tokens);
        Ok(())
    }

    /// Attempt exactly one refresh. Returns Ok(true) when a new access
    /// token was obtained, Ok(false) when no refresh token exists.
    pub async fn try_refresh(&self, http: &reqwest::Client) -> UpstreamResult<bool> {
        let AuthPolicy::Oauth(cfg) = &self.policy else {
            return Ok(false);
        };
        let Some(refresh_token) = self
            .tokens
            .lock()
            .as_ref()
            .and_then(|t| t.refresh_token.clone())
        else {
            debug!("no refresh token stored; cannot refresh");
            return Ok(false);
        };

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
            ("client_id", cfg.client_id.clone()),
        ];
        if let Some(secret) = &cfg.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        match request_tokens(http, &cfg.token_endpoint, &form).await {
            Ok(tokens) => {
                *self.tokens.lock() = Some(tokens);
                Ok(true)
            }
            Err(e) => {
                warn!("token refresh failed: {}", e);
                Ok(false)
            }
        }
    }
}

async fn request_tokens(
    http: &reqwest::Client,
    token_endpoint: &str,
    form: &[(&str, String)],
) -> UpstreamResult<OauthTokens> {
    let response = http
        .post(token_endpoint)
        .form(form)
        .send()
        .await
        .map_err(|e| UpstreamError::Unavailable(format!("token endpoint: {}", e)))?;

    if !response.status().is_success() {
        return Err(UpstreamError::AuthRequired {
            authorization_url: None,
        });
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| UpstreamError::Protocol(format!("token response: {}", e)))?;

    Ok(OauthTokens {
        access_token: body.access_token,
        refresh_token: body.refresh_token,
        expires_at: body.expires_in.map(|s| Utc::now() + Duration::seconds(s)),
    })
}

fn insert_if_absent(
    headers: &mut HeaderMap,
    name: HeaderName,
    value: &str,
) -> UpstreamResult<()> {
    if !headers.contains_key(&name) {
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| UpstreamError::Config("invalid auth header value".to_string()))?;
        headers.insert(name, header_value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_is_urlsafe_sha256() {
        // RFC 7636 appendix B test vector
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(pkce_s256(verifier), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn bearer_policy_sets_authorization() {
        let state = AuthState::new(AuthPolicy::Bearer {
            token: "tok".to_string(),
        });
        let mut headers = HeaderMap::new();
        state.apply(&mut headers).expect("apply");
        assert_eq!(headers[AUTHORIZATION], "Bearer tok");
    }

    #[test]
    fn explicit_header_wins_over_policy() {
        let state = AuthState::new(AuthPolicy::Bearer {
            token: "tok".to_string(),
        });
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer custom"));
        state.apply(&mut headers).expect("apply");
        assert_eq!(headers[AUTHORIZATION], "Bearer custom");
    }

    #[test]
    fn basic_policy_encodes_credentials() {
        let state = AuthState::new(AuthPolicy::Basic {
            username: "u".to_string(),
            password: "p".to_string(),
        });
        let mut headers = HeaderMap::new();
        state.apply(&mut headers).expect("apply");
        assert_eq!(headers[AUTHORIZATION], "Basic dTpw");
    }

    #[test]
    fn authorization_url_carries_pkce_params() {
        let state = AuthState::new(AuthPolicy::Oauth(OauthConfig {
            authorization_endpoint: "https://auth.example.com/authorize".to_string(),
            token_endpoint: "https://auth.example.com/token".to_string(),
            client_id: "client-1".to_string(),
            client_secret: None,
            redirect_uri: "https://gw.example.com/callback".to_string(),
            scopes: vec!["mcp".to_string()],
        }));

        let url = state.begin_authorization().expect("begin");
        let parsed = Url::parse(&url).expect("parse");
        let pairs: HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "client-1");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert!(pairs.contains_key("code_challenge"));
        assert!(pairs.contains_key("state"));
        assert_eq!(pairs["scope"], "mcp");
    }

    #[test]
    fn clear_wipes_tokens() {
        let state = AuthState::with_tokens(
            AuthPolicy::Oauth(OauthConfig {
                authorization_endpoint: "https://a.example.com/auth".to_string(),
                token_endpoint: "https://a.example.com/token".to_string(),
                client_id: "c".to_string(),
                client_secret: None,
                redirect_uri: "https://g.example.com/cb".to_string(),
                scopes: vec![],
            }),
            Some(OauthTokens {
                access_token: "at".to_string(),
                refresh_token: Some("rt".to_string()),
                expires_at: None,
            }),
        );
        assert!(state.tokens().is_some());
        state.clear();
        assert!(state.tokens().is_none());
    }

    #[test]
    fn debug_masks_secrets() {
        let policy = AuthPolicy::Bearer {
            token: "super-secret".to_string(),
        };
        let rendered = format!("{:?}", policy);
        assert!(!rendered.contains("super-secret"));
    }
}
