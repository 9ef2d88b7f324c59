use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::Request;
use thiserror::Error;

use crate::types::ChatFailure;

/// Failures raised by the model service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Model not loaded")]
    ModelUnavailable,

    #[error("Generation failed: {0}")]
    Generation(#[from] anyhow::Error),
}

/// Failures surfaced to HTTP clients as `{success: false, error}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(&'static str),

    #[error("Model not loaded")]
    ModelUnavailable,

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::InvalidInput(_) => Status::BadRequest,
            ApiError::ModelUnavailable | ApiError::Internal => Status::InternalServerError,
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::ModelUnavailable => ApiError::ModelUnavailable,
            ServiceError::Generation(e) => {
                tracing::error!("unrecovered generation error: {e:#}");
                ApiError::Internal
            }
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        let body = Json(ChatFailure::new(self.to_string()));
        (status, body).respond_to(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(
            ApiError::InvalidInput("Message is required").status(),
            Status::BadRequest
        );
        assert_eq!(ApiError::ModelUnavailable.status(), Status::InternalServerError);
        assert_eq!(ApiError::Internal.status(), Status::InternalServerError);
    }

    #[test]
    fn service_errors_map_to_api_errors() {
        assert!(matches!(
            ApiError::from(ServiceError::ModelUnavailable),
            ApiError::ModelUnavailable
        ));
        let api = ApiError::from(ServiceError::Generation(anyhow::anyhow!("boom")));
        assert_eq!(api.to_string(), "Internal server error");
    }
}
