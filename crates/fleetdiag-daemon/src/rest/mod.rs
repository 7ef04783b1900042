//! HTTP surface of the daemon.
//!
//! All diagnostics routes live under `/system/health/v1`; Prometheus metrics
//! are served at `/metrics`.

mod bundles;
mod legacy;
mod logs;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use fleetdiag_core::bundle::BundleError;
use fleetdiag_core::config::BASE_ROUTE;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Error body of the lifecycle API: `{"code": …, "error": …}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// HTTP status code, repeated in the body.
    pub code: u16,

    /// Human-readable message.
    pub error: String,
}

impl ApiError {
    fn new(code: StatusCode, error: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            error: error.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Map a lifecycle error onto its wire representation.
///
/// [`BundleError::State`] is special-cased by the handlers that answer with
/// the bundle record itself.
fn bundle_error(err: &BundleError) -> ApiError {
    let code = match err {
        BundleError::InvalidId { .. } => StatusCode::BAD_REQUEST,
        BundleError::NotFound { .. } | BundleError::NotDone { .. } => StatusCode::NOT_FOUND,
        BundleError::AlreadyExists { .. } => StatusCode::CONFLICT,
        BundleError::Workdir { .. } => StatusCode::INSUFFICIENT_STORAGE,
        BundleError::Gone { .. } => StatusCode::GONE,
        BundleError::State { .. } | BundleError::Storage { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    ApiError::new(code, err.to_string())
}

/// The daemon's full router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/logs", get(logs::index))
        .route("/logs/units/:entity", get(logs::units))
        .route("/logs/files/:entity", get(logs::files))
        .route("/logs/cmds/:entity", get(logs::cmds))
        .route("/report/diagnostics", get(bundles::list))
        .route(
            "/report/diagnostics/:id",
            put(bundles::create).get(bundles::get).delete(bundles::remove),
        )
        .route("/report/diagnostics/:id/file", get(bundles::get_file))
        .route("/report/diagnostics/create", post(legacy::create))
        .route("/report/diagnostics/cancel", post(legacy::cancel))
        .route("/report/diagnostics/status", get(legacy::status))
        .route("/report/diagnostics/status/all", get(legacy::status_all))
        .route("/report/diagnostics/list", get(legacy::list))
        .route("/report/diagnostics/serve/:name", get(legacy::serve))
        .route("/report/diagnostics/delete/:name", post(legacy::delete));

    Router::new()
        .nest(BASE_ROUTE, api)
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Prometheus text exposition of the daemon registry.
async fn metrics(State(state): State<AppState>) -> Response {
    let families = state.registry.gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&families, &mut buf) {
        return ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("could not encode metrics: {err}"),
        )
        .into_response();
    }
    ([("content-type", prometheus::TEXT_FORMAT)], buf).into_response()
}
