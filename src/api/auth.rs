use super::error::ApiError;
use crate::entity::UserId;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

/// Header carrying the identity verified by the authenticating proxy in front
/// of this service. It is trusted as-is.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(UserId::parse)
            .map(CurrentUser)
            .ok_or_else(|| ApiError::unauthorized("User ID not found in request"))
    }
}
