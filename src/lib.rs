//! Actix-web middleware for per-request structured logging and panic recovery.
//!
//! Two middlewares, meant to be used together:
//! - [`LogRequest`] gives every request an id and a logger carrying it, observes the
//!   response and writes one access record per request.
//! - [`Recoverer`] turns a panic anywhere inside it into a logged error and a plain
//!   `500 Internal Server Error` response, so one bad request never takes the worker down.
//!   A panic while the body streams is logged too and ends the body with an error.
//!
//! Records are written by a [`structured_logger`] backend set up with [`init_logger`].
//!
//! # Examples:
//! ```rust,no_run
//! use actix_web::{web, App, HttpServer};
//! use actix_web_middleware_reqlog::{init_logger, Field, LogRequest, Logger, Recoverer};
//!
//! async fn item(log: Logger, id: web::Path<u32>) -> String {
//!     log.info("loading item", &[Field::uint("id", u64::from(*id))]);
//!     format!("item {id}")
//! }
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     // production JSON output; `true` selects the development format
//!     let base = init_logger(false).map_err(std::io::Error::other)?;
//!     actix_web_middleware_reqlog::capture_panic_backtraces();
//!
//!     HttpServer::new(move || {
//!         App::new()
//!             .wrap(LogRequest::new(base.clone()).exclude("/health"))
//!             .wrap(Recoverer::new(base.clone()))
//!             .route("/items/{id}", web::get().to(item))
//!             .route("/health", web::get().to(|| async { "up" }))
//!     })
//!     .bind("127.0.0.1:8080")?
//!     .run()
//!     .await
//! }
//! ```
//!
//! A request to `/items/42` then produces an access record like:
//! ```text
//! {"timestamp":"2026-10-18T09:12:44.123456789Z","lvl":"info","logger":"actix_web_middleware_reqlog::wrapper",
//!  "msg":"request","bytes":7,"clientIP":"127.0.0.1:51234","duration":184,"method":"GET",
//!  "requestID":"1f0ac1e2-...","status":200,"url":"/items/42"}
//! ```
//!
//! # Access record fields
//!
//! - `requestID` - id of the request, also on every record of the per-request logger
//! - `method` - HTTP method
//! - `url` - request URI as received (path and query)
//! - `status` - response status code
//! - `clientIP` - peer address of the connection
//! - `bytes` - response body size in bytes
//! - `duration` - time from entering the middleware until the body is done, in microseconds
//!
//! # Response observation
//!
//! [`ResponseObserver`] wraps anything implementing [`ResponseSink`] and records the
//! committed status and the number of body bytes, optionally copying the body to a
//! second writer. [`LogRequest`] uses it on every response body; handlers can use it
//! with [`BufferedResponse`] to build responses writer style.
//!
//! # Feature Flags
//!
//! - `uuid_v7` - Use UUIDv7 instead of UUIDv1 for request IDs
//! - `tracing-request-id` - Reuse the request ID set by `tracing-actix-web`'s `TracingLogger`

mod backend;
mod error;
mod logger;
mod observer;
mod recoverer;
#[cfg(test)]
mod test_util;
mod wrapper;

pub use crate::backend::{Config, Format, init_logger};
pub use crate::error::{InitError, RecoveredPanic};
pub use crate::logger::{
    LogRequest, LogRequestResponse, LogRequestService, ObservedBody, REQUEST_ID_FIELD, RequestId,
};
pub use crate::observer::{BodyStream, BufferedResponse, ResponseObserver, ResponseSink};
pub use crate::recoverer::{
    RecoveredBody, Recoverer, RecovererResponse, RecovererService, capture_panic_backtraces,
    panic_message,
};
pub use crate::wrapper::{Field, Logger, Value};
