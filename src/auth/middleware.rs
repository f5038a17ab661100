use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::auth::token;
use crate::error::ApiError;
use crate::store::AppState;

/// Authenticated principal extracted from a bearer token. The core consumes
/// a validated principal; this extractor is the validation seam.
#[derive(Debug, Clone)]
pub struct AuthPrincipal {
    pub principal: String,
}

impl AuthPrincipal {
    pub fn is_admin(&self) -> bool {
        self.principal == "admin"
    }
}

impl FromRequestParts<AppState> for AuthPrincipal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        let hash = token::hash_token(raw);
        let principal: Option<String> = sqlx::query_scalar(
            "SELECT principal FROM api_tokens WHERE token_hash = $1 AND is_active = true",
        )
        .bind(&hash)
        .fetch_optional(&state.pool)
        .await?;

        principal
            .map(|principal| Self { principal })
            .ok_or(ApiError::Unauthorized)
    }
}
