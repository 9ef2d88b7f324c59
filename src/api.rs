use std::sync::Arc;

use rocket::http::Status;
use rocket::serde::json::{Json, Value};
use rocket::{catch, catchers, get, post, routes, Build, Request, Rocket, State};

use crate::app_state::ModelService;
use crate::cors::{self, Cors};
use crate::error::ApiError;
use crate::types::{ChatFailure, ChatReply, ChatRequest, HealthResponse, ModelInfoResponse};

const MESSAGE_REQUIRED: &str = "Message is required";
const MESSAGE_EMPTY: &str = "Message cannot be empty";

#[get("/health")]
pub async fn health(service: &State<Arc<ModelService>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model_loaded: service.is_loaded(),
        model_name: service.model_name().to_string(),
        device: service.device().to_string(),
    })
}

#[post("/chat", data = "<body>")]
pub async fn chat(
    service: &State<Arc<ModelService>>,
    body: Option<Json<Value>>,
) -> Result<Json<ChatReply>, ApiError> {
    let req = parse_chat_request(body.map(Json::into_inner))?;

    tracing::info!("chat request ({} chars)", req.message.chars().count());
    let response = service.reply(&req.message).await?;

    Ok(Json(ChatReply::new(response)))
}

#[get("/model/info")]
pub async fn model_info(service: &State<Arc<ModelService>>) -> Json<ModelInfoResponse> {
    let config = service.config();
    Json(ModelInfoResponse {
        model_name: config.model_name.clone(),
        model_path: config.model_path.clone(),
        model_loaded: service.is_loaded(),
        device: service.device().to_string(),
        model_location: service.model_location(),
    })
}

/// Every error page is JSON; panics in handlers arrive here as 500.
#[catch(default)]
pub fn json_catcher(status: Status, _req: &Request<'_>) -> (Status, Json<ChatFailure>) {
    let error = if status == Status::InternalServerError {
        "Internal server error"
    } else {
        status.reason().unwrap_or("Unknown error")
    };
    (status, Json(ChatFailure::new(error)))
}

fn parse_chat_request(body: Option<Value>) -> Result<ChatRequest, ApiError> {
    let message = body
        .as_ref()
        .and_then(|v| v.get("message"))
        .ok_or(ApiError::InvalidInput(MESSAGE_REQUIRED))?;

    match message.as_str() {
        Some(text) if !text.trim().is_empty() => Ok(ChatRequest {
            message: text.to_string(),
        }),
        _ => Err(ApiError::InvalidInput(MESSAGE_EMPTY)),
    }
}

/// Rocket instance bound to all interfaces on `port`.
pub fn build_rocket(service: Arc<ModelService>, port: u16) -> Rocket<Build> {
    let figment = rocket::Config::figment()
        .merge(("address", "0.0.0.0"))
        .merge(("port", port));

    rocket::custom(figment)
        .manage(service)
        .attach(Cors)
        .mount("/api", routes![health, chat, model_info])
        .mount("/", routes![cors::preflight])
        .register("/", catchers![json_catcher])
}
