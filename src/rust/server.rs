//! HTTP routes for the gateway.
//!
//! Thin plumbing over [`Gateway`](crate::gateway::Gateway): readiness,
//! status codes and payloads are decided by the gateway and [`GatewayError`].

use std::convert::Infallible;
use std::net::IpAddr;

use bytes::Buf;
use futures_util::TryStreamExt;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use warp::http::StatusCode;
use warp::multipart::{FormData, Part};
use warp::{Filter, Rejection, Reply};

use crate::classifier::PredictionResult;
use crate::error::{ErrorBody, GatewayError};
use crate::gateway::SharedGateway;

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: u64 = 16 * 1024 * 1024;

/// Multipart field that carries the image.
pub const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub success: bool,
    pub prediction: PredictionResult,
    pub model_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hf_repo: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LatestResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predictions: Option<PredictionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PredictQuery {
    pub top_k: Option<usize>,
}

// =============================================================================
// Routes
// =============================================================================

/// Builds the complete route tree.
pub fn routes(
    gateway: SharedGateway,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let root = warp::path::end()
        .and(warp::get())
        .and(with_gateway(gateway.clone()))
        .map(handle_health);

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_gateway(gateway.clone()))
        .map(handle_health);

    let predict = warp::path("predict")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::query::<PredictQuery>())
        .and(warp::multipart::form().max_length(MAX_UPLOAD_BYTES))
        .and(with_gateway(gateway.clone()))
        .and_then(handle_predict);

    let latest = warp::path("predictions")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_gateway(gateway.clone()))
        .map(handle_latest);

    let reload = warp::path("reload")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_gateway(gateway))
        .map(handle_reload);

    // Browser clients call from a different origin
    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "OPTIONS"])
        .allow_headers(vec!["content-type"]);

    root.or(health)
        .or(predict)
        .or(latest)
        .or(reload)
        .recover(handle_rejection)
        .with(cors)
}

/// Serves until the process is stopped.
pub async fn serve(gateway: SharedGateway) -> anyhow::Result<()> {
    let host: IpAddr = gateway
        .config()
        .host
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", gateway.config().host, e))?;
    let port = gateway.config().port;

    info!("Server listening on {}:{}", host, port);
    warp::serve(routes(gateway)).run((host, port)).await;
    Ok(())
}

// =============================================================================
// Filters
// =============================================================================

fn with_gateway(
    gateway: SharedGateway,
) -> impl Filter<Extract = (SharedGateway,), Error = Infallible> + Clone {
    warp::any().map(move || gateway.clone())
}

// =============================================================================
// Handlers
// =============================================================================

fn handle_health(gateway: SharedGateway) -> warp::reply::Response {
    // Always 200 so platform probes keep the process alive while loading
    warp::reply::json(&gateway.health()).into_response()
}

async fn handle_predict(
    query: PredictQuery,
    form: FormData,
    gateway: SharedGateway,
) -> Result<warp::reply::Response, Infallible> {
    let upload = match read_upload(form).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            return Ok(gateway_error_response(&GatewayError::MissingUpload(
                "No file provided".into(),
            )))
        }
        Err(e) => {
            warn!("Malformed multipart body: {}", e);
            return Ok(gateway_error_response(&GatewayError::MissingUpload(
                "Malformed upload".into(),
            )));
        }
    };

    match gateway.predict_upload(upload, query.top_k).await {
        Ok(prediction) => {
            let source = &gateway.config().source;
            let body = PredictResponse {
                success: true,
                prediction,
                model_source: source.label().to_string(),
                hf_repo: source.repo_id().map(str::to_string),
            };
            Ok(warp::reply::json(&body).into_response())
        }
        Err(e) => Ok(gateway_error_response(&e)),
    }
}

fn handle_latest(gateway: SharedGateway) -> warp::reply::Response {
    match gateway.latest_prediction() {
        Ok(Some(prediction)) => warp::reply::json(&LatestResponse {
            success: true,
            predictions: Some(prediction),
            message: None,
        })
        .into_response(),
        Ok(None) => warp::reply::json(&LatestResponse {
            success: false,
            predictions: None,
            message: Some("No predictions available yet".into()),
        })
        .into_response(),
        Err(e) => {
            error!("Failed to read latest prediction: {}", e);
            gateway_error_response(&e)
        }
    }
}

fn handle_reload(gateway: SharedGateway) -> warp::reply::Response {
    let started = gateway.trigger_reload();
    let status = if started {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    warp::reply::with_status(warp::reply::json(&gateway.health()), status).into_response()
}

/// Turns every rejection into the same JSON error body the handlers use.
async fn handle_rejection(err: Rejection) -> Result<warp::reply::Response, Infallible> {
    let (status, message) = if err.find::<warp::reject::InvalidQuery>().is_some() {
        (StatusCode::BAD_REQUEST, "Invalid query parameters")
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Uploaded file is too large")
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (StatusCode::LENGTH_REQUIRED, "Content-Length header is required")
    } else if err.find::<warp::reject::InvalidHeader>().is_some()
        || err.find::<warp::reject::MissingHeader>().is_some()
        || err.find::<warp::reject::UnsupportedMediaType>().is_some()
    {
        return Ok(gateway_error_response(&GatewayError::MissingUpload(
            "No file provided".into(),
        )));
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found")
    } else {
        error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    };

    Ok(error_response(status, message))
}

// =============================================================================
// Helpers
// =============================================================================

/// Collects the first non-empty `file` part, or `None` if the form has none.
async fn read_upload(form: FormData) -> Result<Option<Vec<u8>>, warp::Error> {
    let mut parts = form;
    while let Some(part) = parts.try_next().await? {
        if part.name() != UPLOAD_FIELD {
            continue;
        }
        if part.filename().map_or(false, str::is_empty) {
            // A file input submitted with nothing selected
            return Ok(None);
        }
        let bytes = read_part(part).await?;
        return Ok(if bytes.is_empty() { None } else { Some(bytes) });
    }
    Ok(None)
}

async fn read_part(part: Part) -> Result<Vec<u8>, warp::Error> {
    part.stream()
        .try_fold(Vec::new(), |mut acc, mut chunk| async move {
            while chunk.has_remaining() {
                let slice = chunk.chunk();
                let len = slice.len();
                acc.extend_from_slice(slice);
                chunk.advance(len);
            }
            Ok::<_, warp::Error>(acc)
        })
        .await
}

fn error_response(status: StatusCode, message: &str) -> warp::reply::Response {
    let body = ErrorBody {
        error: message.to_string(),
        retryable: false,
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn gateway_error_response(err: &GatewayError) -> warp::reply::Response {
    if err.status_code() >= 500 {
        error!("Request failed: {}", err);
    } else {
        info!("Request rejected: {}", err);
    }
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    warp::reply::with_status(warp::reply::json(&err.to_body()), status).into_response()
}
