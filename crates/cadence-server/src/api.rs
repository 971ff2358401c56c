//! Conversation lifecycle routes.

use crate::AppState;
use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use cadence_agent::AgentError;
use cadence_types::Conversation;
use cadence_voice::VoiceError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const MAX_CONVERSATION_ID_LEN: usize = 128;
const MAX_IDENTITY_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::ConversationNotFound(_) | AgentError::MessageNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            AgentError::InvalidState { .. } | AgentError::Transition(_) => {
                ApiError::Conflict(err.to_string())
            }
            AgentError::Voice(VoiceError::Config(msg)) => ApiError::ServiceUnavailable(msg),
            other => {
                tracing::error!(error = %other, "conversation operation failed");
                ApiError::InternalServerError(other.to_string())
            }
        }
    }
}

/// Conversation ids double as room names, so they are kept to a safe
/// alphabet.
pub(crate) fn validate_conversation_id(id: &str) -> Result<(), ApiError> {
    if id.is_empty() || id.len() > MAX_CONVERSATION_ID_LEN {
        return Err(ApiError::BadRequest(format!(
            "conversation id must be 1-{} characters",
            MAX_CONVERSATION_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::BadRequest(
            "conversation id may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }
    Ok(())
}

/// Handler for `POST /api/conversations/{conversationId}/archive`.
pub async fn archive_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    validate_conversation_id(&conversation_id)?;
    Ok(Json(state.manager.archive(&conversation_id).await?))
}

/// Handler for `POST /api/conversations/{conversationId}/unarchive`.
pub async fn unarchive_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    validate_conversation_id(&conversation_id)?;
    Ok(Json(state.manager.unarchive(&conversation_id).await?))
}

/// Handler for `DELETE /api/conversations/{conversationId}`.
pub async fn delete_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    validate_conversation_id(&conversation_id)?;
    Ok(Json(state.manager.delete(&conversation_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub identity: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub room: String,
}

/// Handler for `POST /api/conversations/{conversationId}/token`.
///
/// Issues a room join token, creating the conversation on first use.
pub async fn token_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(payload): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    validate_conversation_id(&conversation_id)?;
    let identity = payload.identity.trim();
    if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
        return Err(ApiError::BadRequest(format!(
            "identity must be 1-{} characters",
            MAX_IDENTITY_LEN
        )));
    }
    let name = payload.name.as_deref().unwrap_or(identity);

    let token = state
        .manager
        .join_token(&conversation_id, identity, name)
        .await?;
    Ok(Json(TokenResponse {
        token,
        url: state.livekit_url.clone(),
        room: conversation_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_ids_are_restricted() {
        assert!(validate_conversation_id("conv_abc-123").is_ok());
        assert!(validate_conversation_id("").is_err());
        assert!(validate_conversation_id("../etc").is_err());
        assert!(validate_conversation_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn agent_errors_map_to_statuses() {
        let status = |err: AgentError| ApiError::from(err).into_response().status();
        assert_eq!(
            status(AgentError::ConversationNotFound("conv_1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(AgentError::InvalidState {
                id: "conv_1".into(),
                status: "archived"
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(AgentError::Voice(VoiceError::Config("no rooms".into()))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(AgentError::MessageNotFound("msg_1".into())),
            StatusCode::NOT_FOUND
        );
    }
}
