//! API error type with Axum `IntoResponse` support.
//!
//! Pipeline errors keep their taxonomy status (422, 409, 502, ...) and
//! carry whatever run context the handler attaches.

use crate::core::error::PipelineError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{error}")]
    Pipeline {
        error: PipelineError,
        /// Extra fields merged into the response body (run id, verdict, audit).
        context: Value,
    },
}

impl ApiError {
    pub fn pipeline(error: PipelineError, context: Value) -> Self {
        Self::Pipeline { error, context }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Pipeline { error, .. } => StatusCode::from_u16(error.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = match &self {
            Self::Pipeline { context, .. } if context.is_object() => context.clone(),
            _ => json!({}),
        };
        body["error"] = Value::String(self.to_string());
        body["status"] = json!(status.as_u16());
        if let Self::Pipeline { error, .. } = &self {
            body["kind"] = json!(error.kind());
        }
        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{ResolutionError, ValidationFailure};
    use crate::core::types::ValidatorKind;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_api_error_not_found() {
        let response = ApiError::NotFound("run 42".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["status"], 404);
        assert!(json["error"].as_str().unwrap().contains("run 42"));
    }

    #[tokio::test]
    async fn test_api_error_pipeline_status_and_context() {
        let err = ApiError::pipeline(
            ValidationFailure {
                blocking: vec![ValidatorKind::Compliance],
                findings: 2,
            }
            .into(),
            json!({"runId": "abc"}),
        );
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["runId"], "abc");
        assert_eq!(json["kind"], "validation_failure");
        assert!(json["error"].as_str().unwrap().contains("compliance"));
    }

    #[test]
    fn test_api_error_every_kind_has_a_status() {
        let err = ApiError::pipeline(
            ResolutionError::Missing {
                field: "kind".into(),
            }
            .into(),
            Value::Null,
        );
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        for kind in crate::core::error::ErrorKind::ALL {
            assert!(StatusCode::from_u16(kind.http_status()).is_ok());
        }
    }
}
