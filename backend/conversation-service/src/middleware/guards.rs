//! Request extractors for the caller's identity
//!
//! Authentication happens at the gateway; this service trusts the forwarded user id.

use std::future::{ready, Ready};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, FromRequest, HttpRequest};

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const INTERNAL_TOKEN_HEADER: &str = "X-Internal-Token";

/// Represents an authenticated user forwarded by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
}

impl User {
    pub fn from_header(req: &HttpRequest) -> Option<Self> {
        req.headers()
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(|id| User { id })
    }
}

impl FromRequest for User {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        ready(User::from_header(req).ok_or(AppError::Unauthorized))
    }
}

/// A trusted backend collaborator (moderation) calling an internal endpoint
#[derive(Debug, Clone, Copy)]
pub struct InternalCaller;

impl FromRequest for InternalCaller {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        let expected = req
            .app_data::<web::Data<AppState>>()
            .and_then(|state| state.config.internal_api_token.clone());

        let result = match expected {
            None => Err(AppError::forbidden("internal endpoints are disabled")),
            Some(expected) => {
                let presented = req
                    .headers()
                    .get(INTERNAL_TOKEN_HEADER)
                    .and_then(|value| value.to_str().ok());
                if presented == Some(expected.as_str()) {
                    Ok(InternalCaller)
                } else {
                    Err(AppError::forbidden("invalid internal token"))
                }
            }
        };
        ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn parses_forwarded_user_id() {
        let id = Uuid::new_v4();
        let req = TestRequest::default()
            .insert_header((USER_ID_HEADER, id.to_string()))
            .to_http_request();
        assert_eq!(User::from_header(&req), Some(User { id }));
    }

    #[test]
    fn rejects_malformed_user_id() {
        let req = TestRequest::default()
            .insert_header((USER_ID_HEADER, "not-a-uuid"))
            .to_http_request();
        assert_eq!(User::from_header(&req), None);
    }
}
