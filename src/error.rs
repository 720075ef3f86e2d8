use actix_web::http::StatusCode;
use actix_web::http::header::ContentType;
use actix_web::{HttpResponse, ResponseError};

/// Failure to set up the logging backend. Fatal: nothing should be served
/// without a logger.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("a logger is already registered with the log facade")]
    AlreadyInitialized(#[from] log::SetLoggerError),
}

/// Returned by [`Recoverer`](crate::Recoverer) in place of a request whose
/// handler panicked.
///
/// Renders as a bare `500 Internal Server Error`; the panic itself has
/// already been logged and is never shown to the client.
#[derive(Debug, thiserror::Error)]
#[error("Internal Server Error")]
pub struct RecoveredPanic;

impl ResponseError for RecoveredPanic {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        HttpResponse::build(status)
            .insert_header(ContentType::plaintext())
            .body(status.canonical_reason().unwrap_or("Internal Server Error"))
    }
}
