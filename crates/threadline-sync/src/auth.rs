use async_trait::async_trait;
use threadline_core::AuthContext;
use threadline_transport::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};

use crate::error::SyncError;

const API_KEY_HEADER: &str = "x-api-key";

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn auth_context(&self) -> AuthContext;
}

/// Fixed credentials, mostly for tests and one-shot CLI runs.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthProvider {
    context: AuthContext,
}

impl StaticAuthProvider {
    pub fn new(context: AuthContext) -> Self {
        Self { context }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::new(AuthContext {
            access_token: Some(token.into()),
            ..Default::default()
        })
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn auth_context(&self) -> AuthContext {
        self.context.clone()
    }
}

/// Reads `THREADLINE_ACCESS_TOKEN`, `THREADLINE_USER_ID` and `THREADLINE_API_KEY`
/// on every call so rotated credentials are picked up.
#[derive(Debug, Clone, Default)]
pub struct EnvAuthProvider;

#[async_trait]
impl AuthProvider for EnvAuthProvider {
    async fn auth_context(&self) -> AuthContext {
        AuthContext {
            access_token: std::env::var("THREADLINE_ACCESS_TOKEN").ok(),
            user_id: std::env::var("THREADLINE_USER_ID").ok(),
            api_key: std::env::var("THREADLINE_API_KEY").ok(),
        }
    }
}

/// Bearer and API-key headers for an outbound request.
pub fn auth_headers(auth: &AuthContext) -> Result<HeaderMap, SyncError> {
    if !auth.is_usable() {
        return Err(SyncError::validation("missing auth context"));
    }
    let mut headers = HeaderMap::new();
    if let Some(token) = auth.bearer_token() {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| SyncError::validation("access token is not a valid header value"))?;
        headers.insert(AUTHORIZATION, value);
    }
    if let Some(key) = auth.api_key() {
        let value = HeaderValue::from_str(key)
            .map_err(|_| SyncError::validation("api key is not a valid header value"))?;
        headers.insert(HeaderName::from_static(API_KEY_HEADER), value);
    }
    Ok(headers)
}

/// The `user_id` to place in a request body: only when no bearer token is sent.
pub fn body_user_id(auth: &AuthContext) -> Option<&str> {
    match auth.bearer_token() {
        Some(_) => None,
        None => auth.user_id(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_becomes_bearer_header() {
        let auth = AuthContext {
            access_token: Some("tok".into()),
            user_id: Some("u-1".into()),
            api_key: Some("k-1".into()),
        };
        let headers = auth_headers(&auth).unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer tok");
        assert_eq!(headers[API_KEY_HEADER], "k-1");
        assert_eq!(body_user_id(&auth), None);
    }

    #[test]
    fn user_id_fallback_without_token() {
        let auth = AuthContext {
            user_id: Some("u-1".into()),
            ..Default::default()
        };
        let headers = auth_headers(&auth).unwrap();
        assert!(headers.get(AUTHORIZATION).is_none());
        assert_eq!(body_user_id(&auth), Some("u-1"));
    }

    #[test]
    fn empty_context_is_a_validation_error() {
        let err = auth_headers(&AuthContext::default()).unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }
}
