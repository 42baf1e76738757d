pub(crate) mod datasets;
pub(crate) mod uploads;

use actix_web::web;

pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(health))
            .route("/upload/enqueue", web::post().to(uploads::enqueue))
            .route("/upload/chunked/initiate", web::post().to(uploads::initiate_chunked))
            .route(
                "/upload/chunked/{session_id}/chunk/{index}",
                web::put().to(uploads::upload_chunk),
            )
            .route("/upload/chunked/{session_id}/status", web::get().to(uploads::chunk_status))
            .route(
                "/upload/chunked/{session_id}/complete",
                web::post().to(uploads::complete_chunked),
            )
            .route("/upload/chunked/{session_id}", web::delete().to(uploads::cancel_chunked))
            .route("/datasets/{identifier}/status", web::get().to(datasets::status))
            .route("/datasets/{uuid}/cancel", web::post().to(datasets::cancel))
            .route("/datasets/{uuid}/retry", web::post().to(datasets::retry)),
    );
}

async fn health() -> actix_web::HttpResponse {
    actix_web::HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}
