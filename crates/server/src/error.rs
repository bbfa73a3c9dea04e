//! Maps the orchestration layer's error taxonomy onto HTTP responses using
//! the `{error:{message,type,code?}}` envelope.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use orc_core::AgentError;

pub struct ApiError(pub AgentError);

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(AgentError::ToolInfrastructure(err))
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    r#type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, r#type, code) = match &self.0 {
            AgentError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request", None),
            AgentError::ModelNotFound(_) => (StatusCode::NOT_FOUND, "model_not_found", None),
            AgentError::UpstreamUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable", None)
            }
            AgentError::UpstreamStatus { code, .. } => {
                (StatusCode::BAD_GATEWAY, "upstream_status", Some(*code))
            }
            AgentError::ToolInfrastructure(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "tool_infrastructure", None)
            }
            AgentError::AgentStuck => (StatusCode::INTERNAL_SERVER_ERROR, "agent_stuck", None),
            AgentError::MaxIterations(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "max_iterations", None)
            }
            AgentError::Cancelled => (StatusCode::BAD_REQUEST, "cancelled", None),
        };

        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.0.to_string(),
                r#type,
                code,
            },
        };
        (status, Json(body)).into_response()
    }
}
