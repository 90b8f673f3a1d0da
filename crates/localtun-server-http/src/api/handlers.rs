use axum::{
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use localtun_auth::bearer_token;
use localtun_control::RegistryError;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::api::models::*;
use crate::api::AppState;

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
}

/// Check the bearer token when token authentication is enabled
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(validator) = &state.validator else {
        return Ok(());
    };

    validator.authorize(authorization(headers)).await.map_err(|e| {
        debug!("Rejected request: {}", e);
        (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(e.to_string()))).into_response()
    })
}

/// Server status
pub async fn server_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        tunnels: state.registry.stats().tunnels,
        mem: memory_usage(),
    })
}

/// Status of one tunnel
pub async fn tunnel_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.registry.get_session(&id) {
        Some(session) => Json(TunnelStatusResponse {
            connected_sockets: session.stats().connected_sockets,
        })
        .into_response(),
        None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

/// Disconnect a tunnel
pub async fn kill_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if state.validator.is_none() {
        return (StatusCode::FORBIDDEN, "token authentication is not enabled").into_response();
    }
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }

    if !state.registry.has_session(&id) {
        return (
            StatusCode::NOT_FOUND,
            format!("client with id {} is not connected", id),
        )
            .into_response();
    }

    info!(tunnel_id = %id, "Disconnecting tunnel on request");
    state.registry.remove_session(&id);

    Json(KillResponse {
        success: true,
        message: format!("client with id {} is disconnected", id),
    })
    .into_response()
}

/// `GET /`: landing page, or `?new` to create a tunnel with a random id
pub async fn root(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let wants_new = query.as_deref().is_some_and(|query| {
        query
            .split('&')
            .any(|pair| pair.split('=').next() == Some("new"))
    });

    if wants_new {
        return create_tunnel(&state, &headers, None).await;
    }

    (
        StatusCode::FOUND,
        [(header::LOCATION, state.landing_page.as_str())],
    )
        .into_response()
}

/// `GET /{id}`: create a tunnel with the requested id
pub async fn create_named_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    create_tunnel(&state, &headers, Some(&id)).await
}

async fn create_tunnel(state: &AppState, headers: &HeaderMap, requested: Option<&str>) -> Response {
    if let Err(response) = authorize(state, headers).await {
        return response;
    }

    let info = match state.registry.create_tunnel(requested).await {
        Ok(info) => info,
        Err(RegistryError::InvalidIdentifier(e)) => {
            debug!("Rejected tunnel id {:?}: {}", requested, e);
            return (StatusCode::FORBIDDEN, Json(ErrorResponse::new(e.to_string()))).into_response();
        }
        Err(e) => {
            error!("Failed to create tunnel: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(e.to_string())),
            )
                .into_response();
        }
    };

    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let url = state.public_url(host, info.id.as_str());

    debug!(tunnel_id = %info.id, url = %url, "Returning tunnel url");

    Json(CreateTunnelResponse {
        id: info.id.into_string(),
        port: info.port,
        max_conn_count: info.max_connections,
        url,
    })
    .into_response()
}

fn memory_usage() -> MemoryUsage {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => parse_proc_status(&status),
        Err(e) => {
            warn!("Could not read memory usage: {}", e);
            MemoryUsage::default()
        }
    }
}

/// Reads `VmRSS` and `VmSize` (reported in kB) from `/proc/<pid>/status`
fn parse_proc_status(status: &str) -> MemoryUsage {
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };

    MemoryUsage {
        rss: field("VmRSS:"),
        virtual_size: field("VmSize:"),
    }
}
