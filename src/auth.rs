//! Principal resolution and permission stages.
//!
//! Authentication proper lives with the identity provider; this module only
//! maps a bearer token to a [`Principal`] and checks permission membership.

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{AppError, AppResult};

pub const WRITE_SENSOR_DATA: &str = "write:sensor_data";
pub const READ_SENSOR_DATA: &str = "read:sensor_data";
pub const WRITE_MACHINES: &str = "write:machines";
pub const READ_MACHINES: &str = "read:machines";
pub const READ_CONFIG: &str = "read:config";
pub const WRITE_CONFIG: &str = "write:config";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub permissions: HashSet<String>,
}

impl Principal {
    pub fn has(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, token: &str) -> Option<Principal>;
}

/// Fixed token table, parsed from `API_TOKENS`:
/// `[subject:]token=perm|perm;[subject:]token=perm`.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenProvider {
    pub fn parse(raw: &str) -> Self {
        let mut tokens = HashMap::new();
        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((identity, perms)) = entry.split_once('=') else {
                tracing::warn!("ignoring API_TOKENS entry without '='");
                continue;
            };
            let (subject, token) = match identity.split_once(':') {
                Some((subject, token)) => (subject.trim(), token.trim()),
                None => (identity.trim(), identity.trim()),
            };
            if token.is_empty() {
                continue;
            }
            let permissions = perms
                .split('|')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            tokens.insert(
                token.to_string(),
                Principal {
                    subject: subject.to_string(),
                    permissions,
                },
            );
        }
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenProvider {
    async fn resolve(&self, token: &str) -> Option<Principal> {
        self.tokens.get(token).cloned()
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub async fn principal_for_token(
    identity: &dyn IdentityProvider,
    token: Option<&str>,
) -> AppResult<Principal> {
    let token = token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::unauthorized("Missing or invalid token"))?;
    identity
        .resolve(token)
        .await
        .ok_or_else(|| AppError::unauthorized("Missing or invalid token"))
}

pub fn require_permission(principal: &Principal, permission: &str) -> AppResult<()> {
    if principal.has(permission) {
        return Ok(());
    }
    Err(AppError::forbidden(format!("Missing permission: {permission}"))
        .with("required_permission", permission))
}

/// First request stage: resolves the bearer token and attaches the
/// principal to the request, or short-circuits with 401.
pub async fn authenticate(
    State(identity): State<Arc<dyn IdentityProvider>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let (mut parts, body) = request.into_parts();
    let principal = principal_for_token(identity.as_ref(), bearer_token(&parts)).await?;
    tracing::debug!(subject = %principal.subject, path = %parts.uri.path(), "authenticated");
    parts.extensions.insert(principal);
    Ok(next.run(Request::from_parts(parts, body)).await)
}

/// Second stage: short-circuits with 403 unless the principal holds
/// `permission`. Must run after [`authenticate`].
pub async fn permission_stage(
    State(permission): State<&'static str>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let principal = request
        .extensions()
        .get::<Principal>()
        .ok_or_else(|| AppError::unauthorized("Missing or invalid token"))?;
    if let Err(err) = require_permission(principal, permission) {
        tracing::warn!(subject = %principal.subject, permission, "permission denied");
        return Err(err);
    }
    Ok(next.run(request).await)
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or_else(|| AppError::unauthorized("Missing or invalid token"))
    }
}
