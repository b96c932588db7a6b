//! Bearer-token negotiation for the registry's challenge/response flow.
//!
//! A registry that needs auth answers with
//! `401` + `WWW-Authenticate: Bearer realm="…",service="…",scope="…"`.
//! The [`Authenticator`] turns that challenge into a token request against
//! `realm`, checks the returned token actually grants the requested actions,
//! and caches it per `(service, scope)`. Until the first challenge is seen the
//! authenticator stays in anonymous mode and attaches nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{OciError, Result};

/// Token lifetime assumed when the token endpoint does not say.
const DEFAULT_TOKEN_LIFETIME: u64 = 60;
/// Tokens are considered expired this long before their stated expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Derive the resource scope a registry request path needs.
///
/// - `/v2/_catalog` → `registry:catalog`
/// - `/v2/<repo…>/tags/list`, `/v2/<repo…>/manifests/<ref>`,
///   `/v2/<repo…>/blobs/<digest>` → `repository:<repo…>`
///
/// Full URLs are accepted; scheme, host and query are ignored. Any other
/// shape is an error.
pub fn parse_scope(uri: &str) -> Result<String> {
    let path = match uri.find("://") {
        Some(pos) => {
            let rest = &uri[pos + 3..];
            rest.find('/').map(|p| &rest[p..]).unwrap_or("")
        }
        None => uri,
    };
    let path = path.split(['?', '#']).next().unwrap_or("");

    let rest = path
        .strip_prefix("/v2/")
        .ok_or_else(|| OciError::InvalidScope(uri.to_string()))?;

    if rest.trim_end_matches('/') == "_catalog" {
        return Ok("registry:catalog".to_string());
    }

    let segments: Vec<&str> = rest.split('/').collect();
    if segments.len() >= 3 && segments.iter().all(|s| !s.is_empty()) {
        let kind = segments[segments.len() - 2];
        let last = segments[segments.len() - 1];
        let known = match kind {
            "tags" => last == "list",
            "manifests" | "blobs" => true,
            _ => false,
        };
        if known {
            let repo = segments[..segments.len() - 2].join("/");
            return Ok(format!("repository:{repo}"));
        }
    }

    Err(OciError::InvalidScope(uri.to_string()))
}

/// A parsed scope: `<type>:<name>[:<action>[,<action>…]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub resource_type: String,
    pub name: String,
    pub actions: Vec<String>,
}

impl Scope {
    /// Parse a scope with actions (`repository:foo/bar:pull`).
    pub fn parse(raw: &str) -> Result<Self> {
        let (resource_type, rest) = raw
            .split_once(':')
            .ok_or_else(|| OciError::InvalidScope(raw.to_string()))?;
        let (name, actions) = rest
            .rsplit_once(':')
            .ok_or_else(|| OciError::InvalidScope(raw.to_string()))?;
        if resource_type.is_empty() || name.is_empty() {
            return Err(OciError::InvalidScope(raw.to_string()));
        }
        Ok(Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            actions: actions
                .split(',')
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }

    /// Build from a resource scope (`repository:foo`) and the default
    /// read action for that resource.
    pub fn for_resource(resource: &str) -> Result<Self> {
        let (resource_type, name) = resource
            .split_once(':')
            .ok_or_else(|| OciError::InvalidScope(resource.to_string()))?;
        let action = if resource_type == "registry" { "*" } else { "pull" };
        Ok(Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            actions: vec![action.to_string()],
        })
    }

    /// `<type>:<name>` without the actions.
    pub fn resource(&self) -> String {
        format!("{}:{}", self.resource_type, self.name)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource_type,
            self.name,
            self.actions.join(",")
        )
    }
}

// ---------------------------------------------------------------------------
// Challenge
// ---------------------------------------------------------------------------

/// A parsed `WWW-Authenticate: Bearer …` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub service: String,
    pub scope: Option<String>,
}

impl Challenge {
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let params = match header.split_once(' ') {
            Some((scheme, params)) if scheme.eq_ignore_ascii_case("bearer") => params,
            _ => {
                return Err(OciError::Unauthorized(format!(
                    "unsupported auth challenge: {header}"
                )))
            }
        };

        let realm = extract_param(params, "realm").ok_or_else(|| {
            OciError::Unauthorized("www-authenticate header missing realm".to_string())
        })?;
        Ok(Self {
            realm,
            service: extract_param(params, "service").unwrap_or_default(),
            scope: extract_param(params, "scope"),
        })
    }
}

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
fn extract_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{}=\"", param);
    let mut from = 0;
    while let Some(found) = header[from..].find(&search) {
        let start = from + found;
        // Only match whole parameter names (not `xrealm=`).
        let boundary = start == 0
            || header[..start]
                .chars()
                .next_back()
                .is_some_and(|c| c == ',' || c.is_whitespace());
        let value_start = start + search.len();
        if boundary {
            return header[value_start..]
                .find('"')
                .map(|end| header[value_start..value_start + end].to_string());
        }
        from = value_start;
    }
    None
}

// ---------------------------------------------------------------------------
// Token claims
// ---------------------------------------------------------------------------

/// One entry of a registry token's `access` claim.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Access {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default)]
    pub actions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    access: Vec<Access>,
}

/// Decode the `access` claim of a JWT without verifying its signature.
/// Returns `None` if the token is not a decodable JWT.
pub fn granted_access(token: &str) -> Option<Vec<Access>> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    Some(claims.access)
}

/// `true` if `granted` contains every action `requested` asks for.
pub fn access_covers(granted: &[Access], requested: &Scope) -> bool {
    granted
        .iter()
        .filter(|a| a.resource_type == requested.resource_type && a.name == requested.name)
        .any(|a| {
            requested
                .actions
                .iter()
                .all(|want| a.actions.iter().any(|have| have == want || have == "*"))
        })
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// A cached bearer credential for one `(service, scope)`.
#[derive(Clone)]
pub struct Authorization {
    pub realm: String,
    pub service: String,
    /// The scope that was requested and verified, including actions.
    pub scope: String,
    token: Arc<SecretString>,
    expires_at: Instant,
}

impl Authorization {
    pub fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }

    /// Value for the `Authorization` request header.
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorization")
            .field("realm", &self.realm)
            .field("service", &self.service)
            .field("scope", &self.scope)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

/// Something that can say whether the current caller may access a scope.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `true` if access to the resource scope (`repository:foo`) is
    /// currently authorized. Denial is `false`, never an error.
    async fn authorize(&self, scope: &str) -> bool;
}

#[derive(Debug, Clone)]
struct TokenEndpoint {
    realm: String,
    service: String,
}

#[derive(Default)]
struct AuthState {
    registry: Option<String>,
    username: Option<String>,
    password: Option<Arc<SecretString>>,
    /// Set once any challenge has been seen.
    endpoint: Option<TokenEndpoint>,
    tokens: HashMap<(String, String), Authorization>,
}

/// Negotiates and caches bearer tokens for one registry.
pub struct Authenticator {
    client: reqwest::Client,
    state: Mutex<AuthState>,
}

impl Authenticator {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            state: Mutex::new(AuthState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record credentials for `registry`. No network I/O happens here; the
    /// registry's auth requirements are discovered on the first 401.
    /// Previously cached tokens are dropped.
    pub fn login(
        &self,
        registry: &str,
        username: Option<String>,
        password: Option<SecretString>,
    ) {
        let mut state = self.state();
        state.registry = Some(registry.to_string());
        state.username = username.filter(|u| !u.is_empty());
        state.password = password.map(Arc::new);
        state.tokens.clear();
        info!(
            registry,
            credentialed = state.username.is_some(),
            "registry login recorded"
        );
    }

    pub fn registry(&self) -> Option<String> {
        self.state().registry.clone()
    }

    /// `true` while the registry has never issued a challenge.
    pub fn anonymous_mode(&self) -> bool {
        self.state().endpoint.is_none()
    }

    /// Cached, unexpired credential for a resource scope (`repository:foo`).
    pub fn get_authorization(&self, scope: &str) -> Option<Authorization> {
        let state = self.state();
        let endpoint = state.endpoint.as_ref()?;
        state
            .tokens
            .get(&(endpoint.service.clone(), scope.to_string()))
            .filter(|a| a.is_valid())
            .cloned()
    }

    /// Drop any cached credential for `scope`.
    pub fn revoke(&self, scope: &str) {
        let mut state = self.state();
        state.tokens.retain(|(_, s), _| s != scope);
    }

    /// Answer a `WWW-Authenticate` challenge: request a token from its realm
    /// and cache it if it grants what the challenge asked for.
    ///
    /// `Ok(false)` means the registry refused (or granted less than asked);
    /// `Err` is reserved for malformed challenges and transport failures.
    pub async fn update_authorization(&self, www_authenticate: &str) -> Result<bool> {
        let challenge = Challenge::parse(www_authenticate)?;
        let scope = challenge
            .scope
            .as_deref()
            .ok_or_else(|| OciError::Unauthorized("challenge carries no scope".to_string()))?;
        let requested = Scope::parse(scope)?;

        self.state().endpoint = Some(TokenEndpoint {
            realm: challenge.realm.clone(),
            service: challenge.service.clone(),
        });

        self.request_token(&challenge.realm, &challenge.service, &requested)
            .await
    }

    async fn request_token(&self, realm: &str, service: &str, requested: &Scope) -> Result<bool> {
        let (username, password) = {
            let state = self.state();
            (state.username.clone(), state.password.clone())
        };

        let scope = requested.to_string();
        debug!(realm, service, scope = %scope, "requesting bearer token");

        let mut req = self
            .client
            .get(realm)
            .query(&[("service", service), ("scope", scope.as_str())]);
        if let Some(user) = &username {
            req = req.basic_auth(user, password.as_ref().map(|p| p.expose_secret()));
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), scope = %scope, "token endpoint refused");
            return Ok(false);
        }

        let body: TokenResponse = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "token endpoint returned an unreadable body");
                return Ok(false);
            }
        };
        let Some(token) = body.token.or(body.access_token).filter(|t| !t.is_empty()) else {
            warn!(scope = %scope, "token response missing token field");
            return Ok(false);
        };

        let covered = granted_access(&token)
            .map(|granted| access_covers(&granted, requested))
            .unwrap_or(false);
        if !covered {
            warn!(scope = %scope, "token does not grant the requested scope");
            return Ok(false);
        }

        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME));
        let authorization = Authorization {
            realm: realm.to_string(),
            service: service.to_string(),
            scope: scope.clone(),
            token: Arc::new(SecretString::from(token)),
            expires_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        };
        self.state()
            .tokens
            .insert((service.to_string(), requested.resource()), authorization);
        info!(scope = %scope, "bearer token cached");
        Ok(true)
    }
}

#[async_trait]
impl Authorizer for Authenticator {
    async fn authorize(&self, scope: &str) -> bool {
        if self.get_authorization(scope).is_some() {
            return true;
        }
        let Some(endpoint) = self.state().endpoint.clone() else {
            // Never challenged: the registry is open.
            return true;
        };
        let requested = match Scope::for_resource(scope) {
            Ok(s) => s,
            Err(e) => {
                warn!(scope, error = %e, "cannot authorize malformed scope");
                return false;
            }
        };
        match self
            .request_token(&endpoint.realm, &endpoint.service, &requested)
            .await
        {
            Ok(granted) => granted,
            Err(e) => {
                warn!(scope, error = %e, "authorization request failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
