//! Legacy cluster-wide job handlers.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use fleetdiag_core::config::BASE_ROUTE;
use fleetdiag_core::job::{BundleCreateRequest, BundleLocation, LegacyResponse};
use serde::Serialize;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use super::ApiError;
use crate::state::AppState;

/// Answer with the HTTP status a legacy response carries.
fn legacy_reply<T: Serialize>(code: u16, body: T) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

/// `POST /report/diagnostics/create`.
pub async fn create(
    State(state): State<AppState>,
    body: Option<Json<BundleCreateRequest>>,
) -> Response {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let job = Arc::clone(&state.job);
    match tokio::task::spawn_blocking(move || job.run(&request)).await {
        Ok(response) => legacy_reply(response.response.response_code, response),
        Err(err) => internal(&err),
    }
}

/// `POST /report/diagnostics/cancel`.
pub async fn cancel(State(state): State<AppState>) -> Response {
    let job = Arc::clone(&state.job);
    match tokio::task::spawn_blocking(move || job.cancel()).await {
        Ok(response) => legacy_reply(response.response_code, response),
        Err(err) => internal(&err),
    }
}

/// `GET /report/diagnostics/status`.
pub async fn status(State(state): State<AppState>) -> Response {
    let job = Arc::clone(&state.job);
    match tokio::task::spawn_blocking(move || job.status()).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => internal(&err),
    }
}

/// `GET /report/diagnostics/status/all` — local plus every peer master.
pub async fn status_all(State(state): State<AppState>) -> Response {
    let job = Arc::clone(&state.job);
    match tokio::task::spawn_blocking(move || job.status_all()).await {
        Ok(Ok(statuses)) => Json(statuses).into_response(),
        Ok(Err(err)) => {
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
        Err(err) => internal(&err),
    }
}

/// `GET /report/diagnostics/list` — bundles stored on this coordinator.
pub async fn list(State(state): State<AppState>) -> Response {
    let job = Arc::clone(&state.job);
    match tokio::task::spawn_blocking(move || job.list_local_bundles()).await {
        Ok(bundles) => Json(bundles).into_response(),
        Err(err) => internal(&err),
    }
}

/// `GET /report/diagnostics/serve/{name}` — stream a local bundle, or
/// redirect to the peer that has it.
pub async fn serve(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request<Body>,
) -> Response {
    if !name.starts_with("bundle-") || !name.ends_with(".zip") {
        let response = LegacyResponse::error(400, "format allowed bundle-*.zip");
        return legacy_reply(response.response_code, response);
    }

    let job = Arc::clone(&state.job);
    let lookup = {
        let name = name.clone();
        tokio::task::spawn_blocking(move || job.locate_bundle(&name)).await
    };
    match lookup {
        Ok(Some(BundleLocation::Local(path))) => match ServeFile::new(path).oneshot(request).await {
            Ok(response) => response.into_response(),
            Err(err) => internal(&err),
        },
        Ok(Some(BundleLocation::Remote { node, .. })) => {
            let url = format!(
                "http://{node}:{}{BASE_ROUTE}/report/diagnostics/serve/{name}",
                state.cfg.master_port
            );
            Redirect::temporary(&url).into_response()
        }
        Ok(None) => {
            ApiError::new(StatusCode::NOT_FOUND, format!("Bundle not found {name}"))
                .into_response()
        }
        Err(err) => internal(&err),
    }
}

/// `POST /report/diagnostics/delete/{name}`.
pub async fn delete(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let job = Arc::clone(&state.job);
    match tokio::task::spawn_blocking(move || job.delete(&name)).await {
        Ok(response) => legacy_reply(response.response_code, response),
        Err(err) => internal(&err),
    }
}

fn internal(err: &dyn std::fmt::Display) -> Response {
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}
