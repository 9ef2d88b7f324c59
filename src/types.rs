use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    pub model_name: String,
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfoResponse {
    pub model_name: String,
    pub model_path: String,
    pub model_loaded: bool,
    pub device: String,
    /// Only present once the model is loaded; serialized as `null` otherwise.
    pub model_location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub success: bool,
    pub response: String,
}

impl ChatReply {
    pub fn new(response: String) -> Self {
        Self {
            success: true,
            response,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFailure {
    pub success: bool,
    pub error: String,
}

impl ChatFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// A validated chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}
