use crate::render::{self, CSV_CONTENT_TYPE};
use crate::server::AdminState;
use ando_core::error::SearchError;
use ando_core::request::{ModeKind, SearchParams, SearchRequest};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// GET /admin/stats/logs.json
pub async fn logs_json(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let request = match validate(&state, &query, ModeKind::Page) {
        Ok(r) => r,
        Err(e) => return error_response(e),
    };
    debug!(
        tz = %request.time_range.timezone,
        interval = request.interval.as_str(),
        mode = ?request.mode,
        filtered = request.filter.is_some(),
        "log page requested"
    );
    match state.search.page(&request).await {
        Ok(result) => (
            StatusCode::OK,
            Json(render::page_json(&result, request.histogram)),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /admin/stats/logs.csv
pub async fn logs_csv(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let request = match validate(&state, &query, ModeKind::Export) {
        Ok(r) => r,
        Err(e) => return error_response(e),
    };
    let export = match state.search.export(&request).await {
        Ok(export) => export,
        Err(e) => return error_response(e),
    };
    info!(
        export_id = %export.id(),
        tz = %request.time_range.timezone,
        filtered = request.filter.is_some(),
        "log export streaming"
    );
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, CSV_CONTENT_TYPE.to_string()),
            (header::CONTENT_DISPOSITION, render::content_disposition(Utc::now())),
        ],
        Body::from_stream(render::csv_stream(export)),
    )
        .into_response()
}

fn validate(
    state: &AdminState,
    query: &HashMap<String, String>,
    kind: ModeKind,
) -> Result<SearchRequest, SearchError> {
    let params = SearchParams::from_query(query);
    let request = SearchRequest::from_params(
        &params,
        kind,
        &state.config.search,
        state.config.index.max_result_window,
    )?;
    Ok(request)
}

fn error_response(err: SearchError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::warn!(code = err.code(), status = status.as_u16(), "log search failed");
    } else {
        debug!(code = err.code(), "log search rejected");
    }
    (status, Json(err.to_json())).into_response()
}
