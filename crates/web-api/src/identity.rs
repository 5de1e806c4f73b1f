//! 调用方身份
//!
//! 认证由前置网关完成，这里只读取它注入的 `X-User-Id` 请求头。

use axum::{extract::FromRequestParts, http::request::Parts};
use domain::UserId;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ApiError::unauthorized("missing caller identity"))?;
        let text = value
            .to_str()
            .map_err(|_| ApiError::unauthorized("invalid caller identity"))?;
        let user_id = text
            .parse::<UserId>()
            .map_err(|_| ApiError::unauthorized("invalid caller identity"))?;
        Ok(AuthenticatedUser(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};

    async fn extract(header: Option<&str>) -> Result<AuthenticatedUser, ApiError> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = header {
            builder = builder.header(USER_ID_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        AuthenticatedUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn numeric_header_is_accepted() {
        assert_eq!(extract(Some(" 42 ")).await.unwrap(), AuthenticatedUser(UserId(42)));
    }

    #[tokio::test]
    async fn missing_or_malformed_header_is_unauthorized() {
        for header in [None, Some("abc"), Some("-1"), Some("")] {
            let err = extract(header).await.unwrap_err();
            assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        }
    }
}
