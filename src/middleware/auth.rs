//! Simplified JWT gate grounded on the teacher's `middleware/auth.rs`
//! `Transform`/`Service` pattern. Dropped: `workspace_id`/`role` and the
//! associated `require_*_access` tier checks (out of scope per the "no
//! per-tenant isolation beyond campaign id" non-goal) — a valid bearer
//! token is sufficient to call the Control Plane.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures_util::future::LocalBoxFuture;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::future::{ready, Ready};
use std::rc::Rc;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
}

pub struct AuthMiddleware {
    pub jwt_secret: Rc<String>,
}

impl AuthMiddleware {
    pub fn new(jwt_secret: String) -> Self {
        Self { jwt_secret: Rc::new(jwt_secret) }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthMiddlewareService {
            service,
            jwt_secret: self.jwt_secret.clone(),
        }))
    }
}

pub struct AuthMiddlewareService<S> {
    service: S,
    jwt_secret: Rc<String>,
}

impl<S, B> Service<ServiceRequest> for AuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let path = req.path();

        // Public routes: tracking pixels/redirects must work with no auth
        // context (they're opened by mail clients, not API callers), and
        // the inbound webhook authenticates itself via a shared secret
        // header instead of a bearer token.
        if path.starts_with("/api/track/") || path == "/health" || path == "/" || path.starts_with("/api/webhooks/") {
            let fut = self.service.call(req);
            return Box::pin(async move { fut.await });
        }

        let auth_header = req.headers().get("Authorization");
        let token = match auth_header {
            Some(header) => {
                let header_str = header.to_str().unwrap_or("");
                if let Some(stripped) = header_str.strip_prefix("Bearer ") {
                    stripped.to_string()
                } else {
                    return Box::pin(async {
                        Err(actix_web::error::ErrorUnauthorized("invalid authorization header format"))
                    });
                }
            }
            None => {
                return Box::pin(async {
                    Err(actix_web::error::ErrorUnauthorized("missing authorization header"))
                });
            }
        };

        let validation = Validation::default();
        let secret = self.jwt_secret.clone();
        let token_data = match decode::<Claims>(&token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
            Ok(data) => data,
            Err(_) => {
                return Box::pin(async { Err(actix_web::error::ErrorUnauthorized("invalid or expired token")) });
            }
        };

        req.extensions_mut().insert(token_data.claims);
        let fut = self.service.call(req);
        Box::pin(async move { fut.await })
    }
}

pub fn extract_claims(req: &actix_web::HttpRequest) -> Result<Claims, actix_web::Error> {
    req.extensions()
        .get::<Claims>()
        .cloned()
        .ok_or_else(|| actix_web::error::ErrorUnauthorized("not authenticated"))
}
