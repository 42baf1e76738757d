use actix_web::HttpResponse;
use datastage_core::PipelineError;
use serde_json::json;

/// Create a standardized JSON error response
pub(crate) fn error_response(
    status: actix_web::http::StatusCode,
    message: impl std::fmt::Display,
) -> HttpResponse {
    HttpResponse::build(status).json(json!({
        "error": message.to_string()
    }))
}

/// Map a pipeline error to the matching HTTP response. Asynchronous worker
/// failures never reach here; they land on the dataset record and surface
/// through the status endpoint.
pub(crate) fn pipeline_error_response(err: &PipelineError) -> HttpResponse {
    use actix_web::http::StatusCode;
    match err {
        PipelineError::Validation(_) => error_response(StatusCode::BAD_REQUEST, err),
        PipelineError::TooLarge(_) => error_response(StatusCode::PAYLOAD_TOO_LARGE, err),
        PipelineError::NotFound(_) => error_response(StatusCode::NOT_FOUND, err),
        PipelineError::Conflict(_) => error_response(StatusCode::CONFLICT, err),
        PipelineError::Transient(_) | PipelineError::RateLimited(_) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, err)
        }
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let cases = [
            (PipelineError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (
                PipelineError::TooLarge("file size 11 exceeds maximum 10".into()),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (PipelineError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (PipelineError::Conflict("dup".into()), StatusCode::CONFLICT),
            (PipelineError::Transient("store down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                PipelineError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(pipeline_error_response(&err).status(), expected, "{err}");
        }
    }
}
