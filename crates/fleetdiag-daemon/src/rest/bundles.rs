//! Bundle lifecycle handlers.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleetdiag_core::bundle::BundleError;
use fleetdiag_core::bundle::BundleType;
use fleetdiag_core::collector::Collector;
use fleetdiag_core::job::ClusterCollector;
use serde::Deserialize;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::error;

use super::{bundle_error, ApiError};
use crate::state::AppState;

/// Optional body of `PUT /report/diagnostics/{id}`.
#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct CreateOptions {
    /// Collect from master nodes.
    #[serde(default)]
    pub masters: bool,

    /// Collect from agent nodes.
    #[serde(default)]
    pub agents: bool,
}

/// Lifecycle errors answered with the bundle record keep their own shape;
/// everything else becomes `{code, error}`.
fn reply_error(err: BundleError) -> Response {
    match err {
        BundleError::State { bundle } => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(bundle)).into_response()
        }
        other => bundle_error(&other).into_response(),
    }
}

/// `GET /report/diagnostics` — every bundle under the working directory.
pub async fn list(State(state): State<AppState>) -> Response {
    let bundles = Arc::clone(&state.bundles);
    match tokio::task::spawn_blocking(move || bundles.list()).await {
        Ok(Ok(list)) => Json(list).into_response(),
        Ok(Err(err)) => reply_error(err),
        Err(err) => internal(err),
    }
}

/// `GET /report/diagnostics/{id}`.
pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let bundles = Arc::clone(&state.bundles);
    match tokio::task::spawn_blocking(move || bundles.get(&id)).await {
        Ok(Ok(bundle)) => Json(bundle).into_response(),
        Ok(Err(err)) => reply_error(err),
        Err(err) => internal(err),
    }
}

/// `PUT /report/diagnostics/{id}` — create a bundle and start collecting.
pub async fn create(
    State(state): State<AppState>,
    Path(id): Path<String>,
    options: Option<Json<CreateOptions>>,
) -> Response {
    let options = options.map(|Json(o)| o).unwrap_or_default();

    let (kind, collectors): (BundleType, Vec<Arc<dyn Collector>>) =
        if options.masters || options.agents {
            let cluster = ClusterCollector::new(
                Arc::clone(&state.job),
                options.masters,
                options.agents,
            );
            (BundleType::Cluster, vec![Arc::new(cluster)])
        } else {
            (BundleType::Local, state.local_collectors.as_ref().clone())
        };

    let bundles = Arc::clone(&state.bundles);
    match tokio::task::spawn_blocking(move || bundles.create(&id, kind, collectors)).await {
        Ok(Ok(bundle)) => Json(bundle).into_response(),
        Ok(Err(err)) => reply_error(err),
        Err(err) => internal(err),
    }
}

/// `DELETE /report/diagnostics/{id}` — drop the archive, keep the record.
pub async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let bundles = Arc::clone(&state.bundles);
    match tokio::task::spawn_blocking(move || bundles.delete(&id)).await {
        Ok(Ok(bundle)) => Json(bundle).into_response(),
        Ok(Err(err)) => reply_error(err),
        Err(err) => internal(err),
    }
}

/// `GET /report/diagnostics/{id}/file` — stream the archive of a Done
/// bundle.
pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request<Body>,
) -> Response {
    let bundles = Arc::clone(&state.bundles);
    let path = match tokio::task::spawn_blocking(move || bundles.get_file(&id)).await {
        Ok(Ok(path)) => path,
        Ok(Err(err)) => return reply_error(err),
        Err(err) => return internal(err),
    };

    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(err) => internal(err),
    }
}

fn internal(err: impl std::fmt::Display) -> Response {
    error!("bundle handler failed: {err}");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}
