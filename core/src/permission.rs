//! Permission Gate (C4): a pluggable policy consulted before dispatching
//! every client operation except `auth` itself (spec.md §4.4).
//!
//! `PermissionPolicy` is a capability interface (spec.md §9 design notes):
//! two optional authentication methods, a mandatory permission check, and
//! an optional anonymous-default accessor and disconnect hook. Five
//! concrete implementations are provided; `CompositePolicy` is itself one
//! such implementation, composing the others by try-in-order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The closed set of gated operations (spec.md §4.4). `Admin` is strictly
/// stronger than any other: a policy granting `admin` implicitly grants
/// every other operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    SpawnSession,
    WriteSession,
    ResizeSession,
    CloseSession,
    JoinSession,
    LeaveSession,
    ListSessions,
    ListContainers,
    Admin,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::SpawnSession => "spawn_session",
            Operation::WriteSession => "write_session",
            Operation::ResizeSession => "resize_session",
            Operation::CloseSession => "close_session",
            Operation::JoinSession => "join_session",
            Operation::LeaveSession => "leave_session",
            Operation::ListSessions => "list_sessions",
            Operation::ListContainers => "list_containers",
            Operation::Admin => "admin",
        }
    }
}

/// Metadata available to a connection-time authenticator: everything the
/// transport can hand over before a single message has been read.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetadata {
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

impl ConnectionMetadata {
    pub fn cookie(&self, name: &str) -> Option<String> {
        let header = self.headers.get("cookie")?;
        header.split(';').find_map(|kv| {
            let (k, v) = kv.trim().split_once('=')?;
            (k == name).then(|| v.to_string())
        })
    }
}

/// Credentials carried by an explicit `auth` message.
#[derive(Debug, Clone, Default)]
pub struct AuthCredentials {
    pub token: Option<String>,
    pub headers: HashMap<String, String>,
    pub data: Option<serde_json::Value>,
}

/// An authenticated (or anonymous-default) identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: String,
    pub display_name: Option<String>,
    pub permissions: Vec<String>,
    pub metadata: Option<String>,
}

impl UserContext {
    pub fn has(&self, op: Operation) -> bool {
        let name = op.as_str();
        self.permissions.iter().any(|p| p == name || p == "admin")
    }
}

#[derive(Debug, Clone)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[async_trait]
pub trait PermissionPolicy: Send + Sync {
    /// Evaluate one operation. Called for every inbound message except
    /// `auth`.
    async fn check(&self, user: &UserContext, op: Operation, resource: Option<&str>) -> Decision;

    /// Evaluate transport-level metadata (headers, query string) at
    /// connection time, before any message has been read. `None` means
    /// this policy does not authenticate at connect time.
    async fn authenticate_connection(&self, _meta: &ConnectionMetadata) -> Option<UserContext> {
        None
    }

    /// Evaluate an explicit `auth` message's credentials.
    async fn authenticate_credentials(
        &self,
        _creds: &AuthCredentials,
    ) -> std::result::Result<UserContext, String> {
        Err("this policy does not support credential authentication".to_string())
    }

    /// The permission set granted to a client that never authenticates,
    /// if the server is configured to allow anonymous access.
    fn anonymous_context(&self) -> Option<UserContext> {
        None
    }

    /// Called (best-effort) when a client's transport closes.
    async fn on_disconnect(&self, _user: &UserContext) {}

    /// Whether this policy actually gates anything, for the `auth_enabled`
    /// flag reported in `server_info` (spec.md §6.1). `NoOpPolicy` grants
    /// every operation unconditionally and reports `false`; every other
    /// policy reports `true`.
    fn auth_enabled(&self) -> bool {
        true
    }
}

/// Grants every operation to every user. Useful for local/dev deployments
/// and as the default when no `auth_provider` is configured.
pub struct NoOpPolicy;

#[async_trait]
impl PermissionPolicy for NoOpPolicy {
    async fn check(&self, _user: &UserContext, _op: Operation, _resource: Option<&str>) -> Decision {
        Decision::Allow
    }

    fn anonymous_context(&self) -> Option<UserContext> {
        Some(UserContext {
            user_id: "anonymous".to_string(),
            display_name: None,
            permissions: vec!["admin".to_string()],
            metadata: None,
        })
    }

    fn auth_enabled(&self) -> bool {
        false
    }
}

/// An in-memory table mapping user id -> roles -> permissions.
pub struct RoleMappedPolicy {
    pub user_roles: HashMap<String, Vec<String>>,
    pub role_permissions: HashMap<String, Vec<String>>,
    pub anonymous_permissions: Option<Vec<String>>,
}

impl RoleMappedPolicy {
    pub fn new() -> Self {
        Self {
            user_roles: HashMap::new(),
            role_permissions: HashMap::new(),
            anonymous_permissions: None,
        }
    }

    fn effective_permissions(&self, user_id: &str) -> Vec<String> {
        self.user_roles
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|role| self.role_permissions.get(role))
            .flatten()
            .cloned()
            .collect()
    }
}

impl Default for RoleMappedPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionPolicy for RoleMappedPolicy {
    async fn check(&self, user: &UserContext, op: Operation, _resource: Option<&str>) -> Decision {
        if user.has(op) {
            Decision::Allow
        } else {
            Decision::Deny { reason: format!("user {} lacks {}", user.user_id, op.as_str()) }
        }
    }

    async fn authenticate_credentials(
        &self,
        creds: &AuthCredentials,
    ) -> std::result::Result<UserContext, String> {
        let user_id = creds
            .data
            .as_ref()
            .and_then(|d| d.get("user_id"))
            .and_then(|v| v.as_str())
            .ok_or("missing user_id in auth data")?
            .to_string();
        let permissions = self.effective_permissions(&user_id);
        Ok(UserContext { user_id, display_name: None, permissions, metadata: None })
    }

    fn anonymous_context(&self) -> Option<UserContext> {
        self.anonymous_permissions.clone().map(|permissions| UserContext {
            user_id: "anonymous".to_string(),
            display_name: None,
            permissions,
            metadata: None,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    username: Option<String>,
    exp: usize,
}

/// Decodes a bearer token (HS256) against a shared secret, extracting the
/// user id and permissions from its claims.
pub struct TokenPolicy {
    secret: String,
}

impl TokenPolicy {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    fn decode(&self, token: &str) -> std::result::Result<UserContext, String> {
        use jsonwebtoken::{decode, DecodingKey, Validation};
        let data = decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| e.to_string())?;
        Ok(UserContext {
            user_id: data.claims.sub,
            display_name: data.claims.username,
            permissions: data.claims.permissions,
            metadata: None,
        })
    }
}

#[async_trait]
impl PermissionPolicy for TokenPolicy {
    async fn check(&self, user: &UserContext, op: Operation, _resource: Option<&str>) -> Decision {
        if user.has(op) {
            Decision::Allow
        } else {
            Decision::Deny { reason: format!("token for {} lacks {}", user.user_id, op.as_str()) }
        }
    }

    async fn authenticate_connection(&self, meta: &ConnectionMetadata) -> Option<UserContext> {
        let token = meta
            .headers
            .get("authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .or_else(|| meta.query.get("token").map(|s| s.as_str()))?;
        self.decode(token).ok()
    }

    async fn authenticate_credentials(
        &self,
        creds: &AuthCredentials,
    ) -> std::result::Result<UserContext, String> {
        let token = creds.token.as_deref().ok_or("missing token")?;
        self.decode(token)
    }
}

/// Parses the transport's cookie header and looks the session id up in a
/// server-side map, populated out-of-band (e.g. by an HTTP login flow
/// this gateway does not itself implement).
pub struct CookiePolicy {
    pub cookie_name: String,
    pub sessions: dashmap::DashMap<String, UserContext>,
}

impl CookiePolicy {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self { cookie_name: cookie_name.into(), sessions: dashmap::DashMap::new() }
    }

    pub fn register(&self, cookie_value: impl Into<String>, user: UserContext) {
        self.sessions.insert(cookie_value.into(), user);
    }
}

#[async_trait]
impl PermissionPolicy for CookiePolicy {
    async fn check(&self, user: &UserContext, op: Operation, _resource: Option<&str>) -> Decision {
        if user.has(op) {
            Decision::Allow
        } else {
            Decision::Deny { reason: format!("session for {} lacks {}", user.user_id, op.as_str()) }
        }
    }

    async fn authenticate_connection(&self, meta: &ConnectionMetadata) -> Option<UserContext> {
        let value = meta.cookie(&self.cookie_name)?;
        self.sessions.get(&value).map(|r| r.clone())
    }
}

/// Tries each inner policy in order; the first that authenticates (or
/// answers a permission check) wins.
pub struct CompositePolicy {
    policies: Vec<Arc<dyn PermissionPolicy>>,
}

impl CompositePolicy {
    pub fn new(policies: Vec<Arc<dyn PermissionPolicy>>) -> Self {
        Self { policies }
    }
}

#[async_trait]
impl PermissionPolicy for CompositePolicy {
    async fn check(&self, user: &UserContext, op: Operation, resource: Option<&str>) -> Decision {
        for policy in &self.policies {
            let decision = policy.check(user, op, resource).await;
            if decision.is_allow() {
                return decision;
            }
        }
        Decision::Deny { reason: format!("no policy granted {}", op.as_str()) }
    }

    async fn authenticate_connection(&self, meta: &ConnectionMetadata) -> Option<UserContext> {
        for policy in &self.policies {
            if let Some(user) = policy.authenticate_connection(meta).await {
                return Some(user);
            }
        }
        None
    }

    async fn authenticate_credentials(
        &self,
        creds: &AuthCredentials,
    ) -> std::result::Result<UserContext, String> {
        let mut last_err = "no policy configured".to_string();
        for policy in &self.policies {
            match policy.authenticate_credentials(creds).await {
                Ok(user) => return Ok(user),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn anonymous_context(&self) -> Option<UserContext> {
        self.policies.iter().find_map(|p| p.anonymous_context())
    }

    async fn on_disconnect(&self, user: &UserContext) {
        for policy in &self.policies {
            policy.on_disconnect(user).await;
        }
    }

    fn auth_enabled(&self) -> bool {
        self.policies.iter().any(|p| p.auth_enabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(perms: &[&str]) -> UserContext {
        UserContext {
            user_id: "u1".into(),
            display_name: None,
            permissions: perms.iter().map(|s| s.to_string()).collect(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn no_op_policy_grants_everything() {
        let policy = NoOpPolicy;
        let u = user(&[]);
        assert!(policy.check(&u, Operation::Admin, None).await.is_allow());
    }

    #[test]
    fn no_op_policy_reports_auth_disabled() {
        assert!(!NoOpPolicy.auth_enabled());
        assert!(RoleMappedPolicy::new().auth_enabled());
    }

    #[test]
    fn composite_reports_auth_enabled_if_any_member_does() {
        let composite = CompositePolicy::new(vec![Arc::new(NoOpPolicy), Arc::new(RoleMappedPolicy::new())]);
        assert!(composite.auth_enabled());
        let all_noop = CompositePolicy::new(vec![Arc::new(NoOpPolicy), Arc::new(NoOpPolicy)]);
        assert!(!all_noop.auth_enabled());
    }

    #[tokio::test]
    async fn role_mapped_denies_missing_permission() {
        let mut policy = RoleMappedPolicy::new();
        policy.user_roles.insert("u1".into(), vec!["viewer".into()]);
        policy.role_permissions.insert("viewer".into(), vec!["list_sessions".into()]);
        let u = policy.authenticate_credentials(&AuthCredentials {
            data: Some(serde_json::json!({"user_id": "u1"})),
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(policy.check(&u, Operation::ListSessions, None).await.is_allow());
        assert!(!policy.check(&u, Operation::SpawnSession, None).await.is_allow());
    }

    #[tokio::test]
    async fn admin_permission_implies_all_operations() {
        let u = user(&["admin"]);
        assert!(u.has(Operation::SpawnSession));
        assert!(u.has(Operation::CloseSession));
    }

    #[tokio::test]
    async fn composite_policy_tries_in_order() {
        let strict = Arc::new(RoleMappedPolicy::new());
        let permissive = Arc::new(NoOpPolicy);
        let composite = CompositePolicy::new(vec![strict, permissive]);
        let u = user(&[]);
        assert!(composite.check(&u, Operation::SpawnSession, None).await.is_allow());
    }

    #[tokio::test]
    async fn cookie_policy_looks_up_registered_session() {
        let policy = CookiePolicy::new("gw_session");
        policy.register("abc123", user(&["join_session"]));
        let mut headers = HashMap::new();
        headers.insert("cookie".to_string(), "other=1; gw_session=abc123".to_string());
        let meta = ConnectionMetadata { headers, query: HashMap::new() };
        let resolved = policy.authenticate_connection(&meta).await.unwrap();
        assert_eq!(resolved.user_id, "u1");
    }
}
