use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        use application::ApplicationError as AppErr;
        use domain::DomainError;

        match error {
            AppErr::Domain(DomainError::InvalidArgument { field, reason }) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_ARGUMENT",
                format!("{}: {}", field, reason),
            ),
            AppErr::Repository(err) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "QUERY_FAILED",
                format!("query failed: {}", err),
            ),
            AppErr::Broker(err) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "BROKER_ERROR",
                format!("broker error: {}", err),
            ),
            AppErr::Presence(err) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "PRESENCE_ERROR",
                format!("presence error: {}", err),
            ),
            AppErr::IdGenerator(err) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ID_GENERATOR_ERROR",
                format!("id generator error: {}", err),
            ),
            err @ AppErr::PublishAfterStore { .. } => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "PUBLISH_FAILED",
                err.to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
