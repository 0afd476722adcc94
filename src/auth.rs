// src/auth.rs
//
// Bearer-token identity. Tokens are HS256 JWTs whose `sub` is the user id;
// whoever issues them (the account service) shares `JWT_SECRET` with us.

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use actix_web::{
    body::{BoxBody, MessageBody},
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http, Error, HttpMessage, HttpRequest, ResponseError,
};
use chrono::{Duration, Utc};
use futures::future::{ok, Ready};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

pub fn create_jwt(user_id: &str, secret: &str, ttl: Duration) -> Result<String> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (Utc::now() + ttl).timestamp().max(0) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref()))
        .map_err(|e| ChatError::Config(format!("token encode error: {}", e)))
}

/// Returns the user id carried by a valid token.
pub fn verify_token(token: &str, secret: &str) -> Result<String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )
    .map(|data| data.claims.sub)
    .map_err(|e| {
        debug!("Token decode error: {}", e);
        ChatError::Unauthorized
    })
}

/// The user the auth middleware attached to this request.
pub fn current_user(req: &HttpRequest) -> Result<String> {
    req.extensions()
        .get::<String>()
        .cloned()
        .ok_or(ChatError::Unauthorized)
}

/// Attaches the bearer's user id to the request extensions. Requests without
/// an `Authorization` header pass through untouched so that handlers decide;
/// a header with a bad token is rejected here.
#[derive(Debug, Clone)]
pub struct Authentication {
    secret: Rc<str>,
}

impl Authentication {
    pub fn new(secret: &str) -> Self {
        Authentication {
            secret: Rc::from(secret),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = AuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<std::result::Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddleware {
            service,
            secret: self.secret.clone(),
        })
    }
}

pub struct AuthMiddleware<S> {
    service: S,
    secret: Rc<str>,
}

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let bearer = req
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string());

        if let Some(token) = bearer {
            match verify_token(&token, &self.secret) {
                Ok(user_id) => {
                    req.extensions_mut().insert(user_id);
                }
                Err(e) => {
                    let (req_parts, _payload) = req.into_parts();
                    let resp = e.error_response();
                    let srv_resp = ServiceResponse::new(req_parts, resp);
                    return Box::pin(async move { Ok(srv_resp) });
                }
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            Ok(res.map_into_boxed_body())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let token = create_jwt("u1", "s3cret", Duration::hours(1)).unwrap();
        assert_eq!(verify_token(&token, "s3cret").unwrap(), "u1");
    }

    #[test]
    fn test_wrong_secret_is_unauthorized() {
        let token = create_jwt("u1", "s3cret", Duration::hours(1)).unwrap();
        assert_eq!(verify_token(&token, "other"), Err(ChatError::Unauthorized));
        assert_eq!(verify_token("garbage", "s3cret"), Err(ChatError::Unauthorized));
    }

    #[test]
    fn test_expired_token_is_unauthorized() {
        let token = create_jwt("u1", "s3cret", Duration::hours(-2)).unwrap();
        assert_eq!(verify_token(&token, "s3cret"), Err(ChatError::Unauthorized));
    }
}
