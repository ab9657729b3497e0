//! Bearer token authentication middleware.
//!
//! Validates the `Authorization: Bearer` credential, optionally checks the
//! Redis revocation set, and injects an [`AuthContext`] into request
//! extensions for handlers and the ingest pipeline. The authenticated user id
//! is recorded on the request span so server spans carry `user.id`.

use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    http::{header, request::Parts},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use jsonwebtoken::{decode, DecodingKey, Validation};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::debug;

use crate::error::SidechainError;

/// Paths that skip authentication.
const PUBLIC_PATHS: &[&str] = &["/health", "/metrics"];

/// Redis set holding revoked token ids.
const REVOKED_TOKENS_KEY: &str = "sidechain:auth:revoked";

/// Bearer token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Expiry, seconds since epoch
    pub exp: u64,
    /// Token id, checked against the revocation set
    #[serde(default)]
    pub jti: Option<String>,
    /// Role names
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Authenticated caller identity, carried in request extensions.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub roles: Vec<String>,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "admin")
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = SidechainError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or_else(|| SidechainError::unauthenticated("bearer token required"))
    }
}

/// Authentication layer.
#[derive(Clone)]
pub struct AuthLayer {
    shared: Arc<AuthShared>,
}

struct AuthShared {
    decoding_key: DecodingKey,
    validation: Validation,
    redis: Option<redis::aio::ConnectionManager>,
    check_revocation: bool,
}

impl AuthLayer {
    pub fn new(
        jwt_secret: &str,
        redis: Option<redis::aio::ConnectionManager>,
        check_revocation: bool,
    ) -> Self {
        let mut validation = Validation::default();
        validation.leeway = 30;
        Self {
            shared: Arc::new(AuthShared {
                decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
                validation,
                redis,
                check_revocation,
            }),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            shared: self.shared.clone(),
        }
    }
}

/// Authentication service.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    shared: Arc<AuthShared>,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let shared = self.shared.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let path = request.uri().path();
            if PUBLIC_PATHS.iter().any(|p| path == *p) {
                return inner.call(request).await;
            }

            let token = match bearer_token(&request) {
                Some(token) => token.to_string(),
                None => {
                    return Ok(
                        SidechainError::unauthenticated("bearer token required").into_response()
                    );
                }
            };

            let claims =
                match decode::<Claims>(&token, &shared.decoding_key, &shared.validation) {
                    Ok(data) => data.claims,
                    Err(err) => {
                        debug!(error = %err, "token validation failed");
                        return Ok(SidechainError::unauthenticated("invalid bearer token")
                            .into_response());
                    }
                };

            if shared.check_revocation {
                if let (Some(jti), Some(redis)) = (&claims.jti, &shared.redis) {
                    let mut conn = redis.clone();
                    let revoked: bool = conn
                        .sismember(REVOKED_TOKENS_KEY, jti.as_str())
                        .await
                        .unwrap_or(false);
                    if revoked {
                        return Ok(
                            SidechainError::forbidden("credential revoked").into_response()
                        );
                    }
                }
            }

            tracing::Span::current().record("user.id", claims.sub.as_str());
            request.extensions_mut().insert(AuthContext {
                user_id: claims.sub,
                roles: claims.roles,
            });

            inner.call(request).await
        })
    }
}

fn bearer_token(request: &Request<Body>) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub(crate) fn make_token(secret: &str, sub: &str, roles: &[&str]) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs())
                + 3_600,
            jti: None,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn claims_round_trip() {
        let token = make_token("s3cret", "user-1", &["admin"]);
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"s3cret"),
            &Validation::default(),
        )
        .unwrap();
        assert_eq!(decoded.claims.sub, "user-1");
        assert!(AuthContext {
            user_id: decoded.claims.sub,
            roles: decoded.claims.roles,
        }
        .is_admin());
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = make_token("s3cret", "user-1", &[]);
        assert!(decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"other"),
            &Validation::default(),
        )
        .is_err());
    }

    #[test]
    fn non_admin_roles() {
        let ctx = AuthContext {
            user_id: "u".into(),
            roles: vec!["producer".into()],
        };
        assert!(!ctx.is_admin());
    }
}
