use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use super::repo_types::Identity;
use crate::error::AppError;

/// Identity attached by the access-control middleware.
pub struct CurrentUser(pub Identity);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .map(CurrentUser)
            .ok_or_else(|| {
                AppError::unauthenticated("You are not logged in! Please log in to get access.")
            })
    }
}
