//! 上游身份：校验服务令牌并从 `X-User-Id` 提取租户。

use axum::extract::{Extension, Request};
use axum::{middleware, response::Response};
use axum_extra::extract::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use std::sync::Arc;
use tracing::{Span, warn};

use crate::error::ApiError;
use crate::workspace::TenantId;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug)]
pub struct AuthConfig {
    pub service_token: String,
}

/// 认证中间件：通过后把 `TenantId` 放入请求扩展并记录到请求 span。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if is_auth_exempt_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let authorized =
        bearer.is_some_and(|TypedHeader(header)| tokens_match(header.token(), &auth.service_token));
    if !authorized {
        warn!("missing or invalid service token");
        return Err(ApiError::Unauthorized);
    }

    let tenant = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(TenantId::parse)
        .ok_or_else(|| ApiError::BadRequest("missing or invalid X-User-Id header".into()))?;
    Span::current().record("tenant", tenant.as_str());
    req.extensions_mut().insert(tenant);
    Ok(next.run(req).await)
}

fn is_auth_exempt_path(path: &str) -> bool {
    path == "/healthz" || path == "/api/v1/version"
}

/// 长度相同时逐字节比较全部内容，耗时不随首个差异位置变化。
fn tokens_match(presented: &str, expected: &str) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison() {
        assert!(tokens_match("s3cret", "s3cret"));
        assert!(!tokens_match("s3cret", "s3creT"));
        assert!(!tokens_match("s3cre", "s3cret"));
        assert!(!tokens_match("", "s3cret"));
    }

    #[test]
    fn only_health_and_version_skip_auth() {
        assert!(is_auth_exempt_path("/healthz"));
        assert!(is_auth_exempt_path("/api/v1/version"));
        assert!(!is_auth_exempt_path("/api/v1/files/rename"));
        assert!(!is_auth_exempt_path("/api/v1/version/../files/read"));
    }
}
