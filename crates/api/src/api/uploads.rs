//! Upload endpoints: cloud-source enqueue and the chunked-upload session
//! flow. Thin translation onto the core operations; no business logic here.

use actix_web::{HttpResponse, web};
use datastage_core::ops::{self, ChunkedInitiate, NewUpload};
use serde::Deserialize;
use tracing::warn;

use crate::AppState;
use crate::errors::pipeline_error_response;

pub(crate) async fn enqueue(
    state: web::Data<AppState>,
    request: web::Json<NewUpload>,
) -> HttpResponse {
    match ops::enqueue_upload(&state.store, &state.staging, request.into_inner()).await {
        Ok(enqueued) => HttpResponse::Ok().json(enqueued),
        Err(e) => pipeline_error_response(&e),
    }
}

pub(crate) async fn initiate_chunked(
    state: web::Data<AppState>,
    request: web::Json<ChunkedInitiate>,
) -> HttpResponse {
    match ops::initiate_chunked(&state.sessions, request.into_inner()).await {
        Ok(session) => HttpResponse::Ok().json(serde_json::json!({
            "session_id": session.session_id,
            "chunk_size": session.chunk_size,
            "total_chunks": session.total_chunks,
        })),
        Err(e) => pipeline_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChunkQuery {
    chunk_hash: String,
}

pub(crate) async fn upload_chunk(
    state: web::Data<AppState>,
    path: web::Path<(String, u32)>,
    query: web::Query<ChunkQuery>,
    body: web::Bytes,
) -> HttpResponse {
    let (session_id, index) = path.into_inner();
    match state.sessions.receive_chunk(&session_id, index, &body, &query.chunk_hash).await {
        Ok(status) => HttpResponse::Ok().json(serde_json::json!({
            "received_chunks": status.received_indices.len(),
            "total_chunks": status.total_chunks,
            "progress_percent": status.progress_percent,
        })),
        Err(e) => {
            warn!(session = %session_id, chunk = index, error = %e, "Chunk rejected");
            pipeline_error_response(&e.into())
        }
    }
}

pub(crate) async fn chunk_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    match state.sessions.status(&path) {
        Ok(status) => HttpResponse::Ok().json(serde_json::json!({
            "received_indices": status.received_indices,
            "total_chunks": status.total_chunks,
            "progress_percent": status.progress_percent,
            "is_complete": status.received_indices.len() as u32 == status.total_chunks,
        })),
        Err(e) => pipeline_error_response(&e.into()),
    }
}

pub(crate) async fn complete_chunked(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    match ops::complete_chunked(&state.store, &state.sessions, &state.staging, &path).await {
        Ok(completed) => HttpResponse::Ok().json(completed),
        Err(e) => pipeline_error_response(&e),
    }
}

pub(crate) async fn cancel_chunked(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    match state.sessions.cancel(&path).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "cancelled": true })),
        Err(e) => pipeline_error_response(&e.into()),
    }
}
