use serde::Serialize;

use crate::auth::middleware::AuthPrincipal;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct ListResponse<T: Serialize> {
    pub items: Vec<T>,
    pub total: i64,
}

/// Operator-only surface (agent registration and removal).
pub fn require_admin(auth: &AuthPrincipal) -> Result<(), ApiError> {
    if auth.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

/// Owners see their own resources; admins see everything.
pub fn require_owner(auth: &AuthPrincipal, owner: &str) -> Result<(), ApiError> {
    if auth.is_admin() || auth.principal == owner {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}
