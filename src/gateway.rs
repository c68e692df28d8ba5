use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::require_api_key;
use crate::bail_gateway;
use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::inference::InferenceClient;
use crate::interpreter::{interpret, ModerationDecision, ModerationPolicy};

const FILE_FIELD: &str = "file";

/// Read-only state shared by all requests, built once at startup.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api_key: Option<Arc<str>>,
    pub(crate) inference: Option<InferenceClient>,
    pub(crate) policy: Arc<ModerationPolicy>,
}

impl AppState {
    pub(crate) fn from_config(config: &Config) -> Result<Self> {
        let inference = match config.inference_token() {
            Some(token) => Some(InferenceClient::new(
                config.inference_url()?,
                token,
                config.upstream_timeout(),
            )?),
            None => None,
        };
        Ok(Self {
            api_key: config.api_key().map(Arc::from),
            inference,
            policy: Arc::new(config.policy()),
        })
    }
}

#[derive(Serialize, Debug)]
pub(crate) struct HealthResponse {
    ok: bool,
    moderation_enabled: bool,
}

pub(crate) fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let moderation_router = Router::new()
        .route("/moderate", post(handle_moderate_request))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(DefaultBodyLimit::max(max_upload_bytes));

    Router::new()
        .route("/health", get(handle_health_request))
        .merge(moderation_router)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[axum_macros::debug_handler]
async fn handle_health_request(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        moderation_enabled: state.inference.is_some(),
    })
}

#[axum_macros::debug_handler]
async fn handle_moderate_request(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> GatewayResult<Json<ModerationDecision>> {
    let mut multipart =
        multipart.map_err(|rejection| GatewayError::new(rejection.status(), rejection.body_text()))?;
    let image = read_file_field(&mut multipart).await?;

    let Some(inference) = state.inference.as_ref() else {
        error!("Rejecting moderation request, no inference token is configured");
        return Err(GatewayError::configuration(
            "Moderation is not configured on this server",
        ));
    };

    let raw = inference.classify(image).await.map_err(|err| {
        error!("Failed to call inference endpoint: {:#}", err);
        GatewayError::upstream(format!("Inference request failed: {:#}", err))
    })?;

    let decision = interpret(raw, &state.policy);
    info!(
        monotonic_counter.moderation_decisions = 1_u64,
        allowed = decision.allowed,
        label = %decision.label,
        score = decision.score,
        "Moderation decision"
    );
    Ok(Json(decision))
}

async fn read_file_field(multipart: &mut Multipart) -> GatewayResult<Bytes> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let content = field.bytes().await.map_err(multipart_error)?;
        if content.is_empty() {
            return Err(GatewayError::bad_request("Empty file"));
        }
        return Ok(content);
    }
    bail_gateway!(
        StatusCode::BAD_REQUEST,
        "Missing file field (multipart/form-data)"
    )
}

fn multipart_error(err: MultipartError) -> GatewayError {
    GatewayError::new(err.status(), err.body_text())
}
