//! The self-describing logs index and local artifact serving.

use std::io::Read;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleetdiag_core::cancel::CancelToken;
use fleetdiag_core::catalog::{CatalogError, EndpointDescriptor, LogProvider};
use fleetdiag_core::collector::{Collector, CommandCollector, FileCollector};
use fleetdiag_core::io::CancelReader;
use tracing::debug;

use super::ApiError;
use crate::state::AppState;

/// `GET /logs` — what this node can provide, given its role.
pub async fn index(State(state): State<AppState>) -> Response {
    match state.discovery.node_role() {
        Ok(role) => {
            Json(state.catalog.endpoints_for_role(role, state.cfg.port)).into_response()
        }
        Err(err) => {
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
    }
}

/// `GET /logs/units/{entity}` — journal of one service-manager unit.
pub async fn units(State(state): State<AppState>, Path(entity): Path<String>) -> Response {
    dispatch(state, LogProvider::Units, entity).await
}

/// `GET /logs/files/{entity}` — one configured local file.
pub async fn files(State(state): State<AppState>, Path(entity): Path<String>) -> Response {
    dispatch(state, LogProvider::Files, entity).await
}

/// `GET /logs/cmds/{entity}` — output of one configured command.
pub async fn cmds(State(state): State<AppState>, Path(entity): Path<String>) -> Response {
    dispatch(state, LogProvider::Cmds, entity).await
}

async fn dispatch(state: AppState, provider: LogProvider, entity: String) -> Response {
    let role = match state.discovery.node_role() {
        Ok(role) => role,
        Err(err) => {
            return ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
                .into_response();
        }
    };

    let descriptor = match state.catalog.resolve(provider, &entity, role) {
        Ok(descriptor) => descriptor,
        Err(err @ CatalogError::NotFound { .. }) => {
            return ApiError::new(StatusCode::NOT_FOUND, err.to_string()).into_response();
        }
        Err(err @ CatalogError::NotAllowed { .. }) => {
            return ApiError::new(StatusCode::FORBIDDEN, err.to_string()).into_response();
        }
        Err(err) => {
            return ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                .into_response();
        }
    };
    debug!(%entity, "dispatching a local artifact");

    let journal = Arc::clone(&state.journal);
    let cfg = Arc::clone(&state.cfg);
    let body = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, String> {
        let token = CancelToken::with_timeout(cfg.collector_timeout);
        let reader: Box<dyn Read + Send> = match descriptor {
            EndpointDescriptor::Http(endpoint) => {
                match journal.read_since(&entity, cfg.units_logs_since) {
                    Ok(reader) => reader,
                    Err(err) if endpoint.optional => {
                        Box::new(std::io::Cursor::new(err.to_string().into_bytes()))
                    }
                    Err(err) => return Err(err.to_string()),
                }
            }
            EndpointDescriptor::File(endpoint) => FileCollector::new(entity.clone(), &endpoint)
                .collect(&token)
                .map_err(|err| err.to_string())?,
            EndpointDescriptor::Command(endpoint) => {
                CommandCollector::new(entity.clone(), &endpoint)
                    .collect(&token)
                    .map_err(|err| err.to_string())?
            }
        };

        let mut out = Vec::new();
        CancelReader::new(token, reader)
            .read_to_end(&mut out)
            .map_err(|err| err.to_string())?;
        Ok(out)
    })
    .await;

    match body {
        Ok(Ok(bytes)) => bytes.into_response(),
        Ok(Err(err)) => {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err).into_response()
        }
        Err(err) => {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}
