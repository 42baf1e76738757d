//! Dataset status, cancel, and manual-retry endpoints.

use actix_web::{HttpResponse, web};
use datastage_core::ops::{self, RetryPhase};
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::errors::pipeline_error_response;

/// Identifier may be a uuid, slug, short_id, or job_id.
pub(crate) async fn status(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    match ops::query_status(&state.store, &path).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => pipeline_error_response(&e),
    }
}

pub(crate) async fn cancel(state: web::Data<AppState>, path: web::Path<Uuid>) -> HttpResponse {
    match ops::cancel(&state.store, *path).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "cancelled": true })),
        Err(e) => pipeline_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RetryRequest {
    phase: RetryPhase,
}

pub(crate) async fn retry(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    request: web::Json<RetryRequest>,
) -> HttpResponse {
    match ops::retry(&state.store, *path, request.phase).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => pipeline_error_response(&e),
    }
}
