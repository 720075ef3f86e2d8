use std::{
    borrow::Cow,
    collections::HashSet,
    fmt,
    future::Future,
    io,
    marker::PhantomData,
    mem,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures_core::ready;
use pin_project_lite::pin_project;
use regex::Regex;
use uuid::Uuid;

use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::body::{BodySize, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::{Error, HttpMessage, Result};

use crate::observer::{BodyStream, ResponseObserver};
use crate::recoverer::LoggerCell;
use crate::wrapper::{Field, Logger};

/// Field carrying the request id on every per-request logger.
pub const REQUEST_ID_FIELD: &str = "requestID";

type TeeFactory = Rc<dyn Fn(&ServiceRequest) -> Option<Box<dyn io::Write>>>;

/// Middleware writing one access record per request.
///
/// For every request it
/// - generates a [`RequestId`],
/// - derives a per-request [`Logger`] from the base logger with a `requestID`
///   field and stores it, with the id, in the request extensions,
/// - observes the response body through a [`ResponseObserver`],
/// - once the body is done, logs `request` at info level with `method`, `url`,
///   `status`, `clientIP`, `bytes` and `duration` (microseconds).
///
/// Handlers get the per-request logger by taking a [`Logger`] argument.
///
/// # Examples
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_reqlog::{LogRequest, Logger};
///
/// let app = App::new()
///     .wrap(LogRequest::new(Logger::global()).exclude("/health"));
/// ```
pub struct LogRequest(Rc<Inner>);

#[derive(Clone)]
struct Inner {
    base: Logger,
    exclude: HashSet<String>,
    exclude_regex: Vec<Regex>,
    log_target: Option<Cow<'static, str>>,
    tee: Option<TeeFactory>,
}

impl LogRequest {
    /// Create `LogRequest` middleware deriving per-request loggers from `base`.
    pub fn new(base: Logger) -> LogRequest {
        LogRequest(Rc::new(Inner {
            base,
            exclude: HashSet::new(),
            exclude_regex: Vec::new(),
            log_target: None,
            tee: None,
        }))
    }

    /// Do not write access records for `path`. Handlers still get a
    /// per-request logger.
    pub fn exclude<T: Into<String>>(mut self, path: T) -> Self {
        Rc::make_mut(&mut self.0).exclude.insert(path.into());
        self
    }

    /// Do not write access records for paths matching `pattern`.
    pub fn exclude_regex<T: AsRef<str>>(mut self, pattern: T) -> Result<Self, regex::Error> {
        let regex = Regex::new(pattern.as_ref())?;
        Rc::make_mut(&mut self.0).exclude_regex.push(regex);
        Ok(self)
    }

    /// Sets the logging target of per-request loggers to `target`.
    ///
    /// By default the base logger's target is kept.
    pub fn log_target(mut self, target: impl Into<Cow<'static, str>>) -> Self {
        Rc::make_mut(&mut self.0).log_target = Some(target.into());
        self
    }

    /// Copy response bodies into the writer `factory` returns for a request.
    /// Requests for which it returns `None` are not copied.
    ///
    /// Failures of the copy are logged at debug level and never affect the
    /// response.
    pub fn tee<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Option<Box<dyn io::Write>> + 'static,
    {
        Rc::make_mut(&mut self.0).tee = Some(Rc::new(factory));
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for LogRequest
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<ObservedBody<B>>;
    type Error = Error;
    type Transform = LogRequestService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(LogRequestService {
            service,
            inner: Rc::clone(&self.0),
        }))
    }
}

/// What the access record says about the request side.
struct AccessEntry {
    method: String,
    url: String,
    client_addr: String,
}

impl AccessEntry {
    fn new(req: &ServiceRequest) -> Self {
        AccessEntry {
            method: req.method().to_string(),
            url: req.uri().to_string(),
            client_addr: req
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
        }
    }

    fn fields(self, observer: &ResponseObserver<BodyStream>, elapsed: Duration) -> [Field; 6] {
        let status = observer.status().map_or(0, |status| status.as_u16());
        [
            Field::str("method", self.method),
            Field::str("url", self.url),
            Field::uint("status", u64::from(status)),
            Field::str("clientIP", self.client_addr),
            Field::uint("bytes", observer.bytes_written() as u64),
            Field::int(
                "duration",
                i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX),
            ),
        ]
    }
}

pin_project! {
    /// Response body that passes every chunk through a [`ResponseObserver`]
    /// and writes the access record when dropped.
    pub struct ObservedBody<B> {
        #[pin]
        body: B,
        observer: ResponseObserver<BodyStream>,
        logger: Logger,
        entry: Option<AccessEntry>,
        start: Instant,
    }

    impl<B> PinnedDrop for ObservedBody<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            this.observer.finalize();

            if let Some(entry) = this.entry.take() {
                let elapsed = this.start.elapsed();
                this.logger.info("request", &entry.fields(this.observer, elapsed));
            }
        }
    }
}

impl<B: MessageBody> MessageBody for ObservedBody<B> {
    type Error = B::Error;

    #[inline]
    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.project();

        match ready!(this.body.poll_next(cx)) {
            Some(Ok(chunk)) => {
                if let Err(err) = this.observer.write(&chunk) {
                    this.logger
                        .debug("response observer failed", &[Field::str("error", err.to_string())]);
                }
                if let Some(err) = this.observer.take_tee_error() {
                    this.logger
                        .debug("response tee failed", &[Field::str("error", err.to_string())]);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => Poll::Ready(None),
        }
    }
}

/// Logger middleware service.
pub struct LogRequestService<S> {
    inner: Rc<Inner>,
    service: S,
}

impl<S, B> Service<ServiceRequest> for LogRequestService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<ObservedBody<B>>;
    type Error = Error;
    type Future = LogRequestResponse<S, B>;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let request_id = RequestId::for_request(&req);
        let mut logger = self
            .inner
            .base
            .with(Field::str(REQUEST_ID_FIELD, request_id.to_string()));
        if let Some(target) = &self.inner.log_target {
            logger = logger.with_target(target.clone());
        }

        {
            let mut extensions = req.extensions_mut();
            if let Some(cell) = extensions.get::<LoggerCell>() {
                cell.fill(logger.clone());
            }
            extensions.insert(request_id);
            extensions.insert(logger.clone());
        }

        let excluded = self.inner.exclude.contains(req.path())
            || self
                .inner
                .exclude_regex
                .iter()
                .any(|r| r.is_match(req.path()));
        let entry = (!excluded).then(|| AccessEntry::new(&req));

        let start = Instant::now();
        let mut observer = ResponseObserver::new(BodyStream::default());
        if let Some(tee) = self.inner.tee.as_ref().and_then(|factory| factory(&req)) {
            observer.set_tee(tee);
        }

        LogRequestResponse {
            fut: self.service.call(req),
            observer,
            logger,
            entry,
            start,
            _phantom: PhantomData,
        }
    }
}

pin_project! {
    pub struct LogRequestResponse<S, B>
    where
        B: MessageBody,
        S: Service<ServiceRequest>,
    {
        #[pin]
        fut: S::Future,
        observer: ResponseObserver<BodyStream>,
        logger: Logger,
        entry: Option<AccessEntry>,
        start: Instant,
        _phantom: PhantomData<B>,
    }
}

impl<S, B> Future for LogRequestResponse<S, B>
where
    B: MessageBody,
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Output = Result<ServiceResponse<ObservedBody<B>>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let res = match ready!(this.fut.poll(cx)) {
            Ok(res) => res,
            Err(err) => return Poll::Ready(Err(err)),
        };

        if let Some(error) = res.response().error() {
            this.logger.debug(
                "error in response",
                &[Field::str("error", format!("{error:?}"))],
            );
        }

        let mut observer = mem::take(this.observer);
        observer.commit_header(res.status());

        let logger = mem::take(this.logger);
        let entry = this.entry.take();
        let start = *this.start;

        Poll::Ready(Ok(res.map_body(move |_, body| ObservedBody {
            body,
            observer,
            logger,
            entry,
            start,
        })))
    }
}

/// Request ID stored in the request extensions.
///
/// Time ordered: UUID v1 by default, UUID v7 with the `uuid_v7` feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub(crate) fn new() -> Self {
        #[cfg(not(feature = "uuid_v7"))]
        {
            Self(Uuid::now_v1(node_id()))
        }
        #[cfg(feature = "uuid_v7")]
        {
            Self(Uuid::now_v7())
        }
    }

    /// Reuse the id `TracingLogger` assigned, if any.
    #[cfg(feature = "tracing-request-id")]
    fn for_request(req: &ServiceRequest) -> Self {
        req.extensions()
            .get::<tracing_actix_web::RequestId>()
            .and_then(|id| Uuid::parse_str(&id.to_string()).ok())
            .map_or_else(RequestId::new, RequestId)
    }

    #[cfg(not(feature = "tracing-request-id"))]
    fn for_request(_: &ServiceRequest) -> Self {
        RequestId::new()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.as_hyphenated(), f)
    }
}

/// Random node id for v1 UUIDs, fixed for the life of the process.
#[cfg(not(feature = "uuid_v7"))]
fn node_id() -> &'static [u8; 6] {
    use std::sync::OnceLock;

    static NODE_ID: OnceLock<[u8; 6]> = OnceLock::new();
    NODE_ID.get_or_init(|| {
        let mut node = [0u8; 6];
        node.copy_from_slice(&Uuid::new_v4().as_bytes()[..6]);
        // multicast bit set: not a real MAC address (RFC 4122 4.5)
        node[0] |= 0x01;
        node
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::Capture;
    use crate::wrapper::Value;
    use actix_web::{
        App, HttpResponse,
        http::StatusCode,
        test::{self, TestRequest},
        web,
    };
    use std::cell::RefCell;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenBuf;

    impl io::Write for BrokenBuf {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_builder() {
        let logger = LogRequest::new(Logger::global());
        assert!(logger.0.exclude.is_empty());
        assert!(logger.0.exclude_regex.is_empty());
        assert!(logger.0.log_target.is_none());
        assert!(logger.0.tee.is_none());

        let logger = LogRequest::new(Logger::global())
            .exclude("/health")
            .exclude_regex("^/api/v1/.*")
            .unwrap()
            .log_target("access")
            .tee(|_| None);

        assert_eq!(logger.0.log_target.as_deref(), Some("access"));
        assert!(logger.0.exclude.contains("/health"));
        assert!(logger.0.exclude_regex[0].is_match("/api/v1/users"));
        assert!(!logger.0.exclude_regex[0].is_match("/api/v2/users"));
        assert!(logger.0.tee.is_some());

        assert!(LogRequest::new(Logger::global()).exclude_regex("(").is_err());
    }

    #[actix_web::test]
    async fn test_access_record() {
        let capture = Capture::new();
        let app = test::init_service(
            App::new()
                .wrap(LogRequest::new(Logger::new(capture.clone())))
                .route("/items/{id}", web::get().to(|| async { "ok" })),
        )
        .await;

        let req = TestRequest::get()
            .uri("/items/42")
            .peer_addr("127.0.0.1:4000".parse().unwrap())
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(test::read_body(res).await.as_ref(), b"ok");

        let records = capture.at(log::Level::Info);
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.message, "request");
        assert_eq!(record.get("method"), Some("GET"));
        assert_eq!(record.get("url"), Some("/items/42"));
        assert_eq!(record.get("status"), Some("200"));
        assert_eq!(record.get("clientIP"), Some("127.0.0.1:4000"));
        assert_eq!(record.get("bytes"), Some("2"));
        let duration: i64 = record.get("duration").unwrap().parse().unwrap();
        assert!(duration >= 0);

        let id = record.get(REQUEST_ID_FIELD).unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[actix_web::test]
    async fn test_status_and_size_from_handler() {
        let capture = Capture::new();
        let app = test::init_service(
            App::new()
                .wrap(LogRequest::new(Logger::new(capture.clone())))
                .route(
                    "/missing",
                    web::get().to(|| async { HttpResponse::NotFound().body("missing") }),
                )
                .route(
                    "/empty",
                    web::get().to(|| async { HttpResponse::NoContent().finish() }),
                ),
        )
        .await;

        let res = test::call_service(&app, TestRequest::get().uri("/missing?q=1").to_request()).await;
        test::read_body(res).await;
        let res = test::call_service(&app, TestRequest::get().uri("/empty").to_request()).await;
        test::read_body(res).await;

        let records = capture.at(log::Level::Info);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("status"), Some("404"));
        assert_eq!(records[0].get("bytes"), Some("7"));
        assert_eq!(records[0].get("url"), Some("/missing?q=1"));
        assert_eq!(records[0].get("clientIP"), Some(""));
        assert_eq!(records[1].get("status"), Some("204"));
        assert_eq!(records[1].get("bytes"), Some("0"));
    }

    #[actix_web::test]
    async fn test_handler_gets_request_logger() {
        let capture = Capture::new();
        let app = test::init_service(
            App::new()
                .wrap(LogRequest::new(Logger::new(capture.clone())).log_target("access"))
                .route(
                    "/",
                    web::get().to(|log: Logger| async move {
                        log.warn("handling", &[]);
                        "done"
                    }),
                ),
        )
        .await;

        for _ in 0..2 {
            let res = test::call_service(&app, TestRequest::get().uri("/").to_request()).await;
            test::read_body(res).await;
        }

        let handled = capture.at(log::Level::Warn);
        let access = capture.at(log::Level::Info);
        assert_eq!(handled.len(), 2);
        assert_eq!(access.len(), 2);

        for (h, a) in handled.iter().zip(&access) {
            assert_eq!(h.target, "access");
            assert_eq!(a.target, "access");
            assert_eq!(h.get(REQUEST_ID_FIELD), a.get(REQUEST_ID_FIELD));
        }
        assert_ne!(
            access[0].get(REQUEST_ID_FIELD),
            access[1].get(REQUEST_ID_FIELD)
        );
    }

    #[actix_web::test]
    async fn test_request_id_in_extensions() {
        let app = test::init_service(
            App::new()
                .wrap(LogRequest::new(Logger::new(Capture::new())))
                .route(
                    "/",
                    web::get().to(|req: actix_web::HttpRequest| async move {
                        let id = req.extensions().get::<RequestId>().copied();
                        let logger = req.extensions().get::<Logger>().cloned();
                        match (id, logger) {
                            (Some(id), Some(logger))
                                if logger.field(REQUEST_ID_FIELD)
                                    == Some(&Value::Str(id.to_string())) =>
                            {
                                HttpResponse::Ok().finish()
                            }
                            _ => HttpResponse::InternalServerError().finish(),
                        }
                    }),
                ),
        )
        .await;

        let res = test::call_service(&app, TestRequest::get().uri("/").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_excluded_paths() {
        let capture = Capture::new();
        let app = test::init_service(
            App::new()
                .wrap(
                    LogRequest::new(Logger::new(capture.clone()))
                        .exclude("/health")
                        .exclude_regex(r"^/assets/.*")
                        .unwrap(),
                )
                .route(
                    "/health",
                    web::get().to(|log: Logger| async move {
                        log.info("health check", &[]);
                        "up"
                    }),
                )
                .route("/assets/{file}", web::get().to(|| async { "asset" }))
                .route("/page", web::get().to(|| async { "page" })),
        )
        .await;

        for uri in ["/health", "/assets/app.js", "/page"] {
            let res = test::call_service(&app, TestRequest::get().uri(uri).to_request()).await;
            test::read_body(res).await;
        }

        let records = capture.at(log::Level::Info);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "health check");
        assert!(records[0].get(REQUEST_ID_FIELD).is_some());
        assert_eq!(records[1].message, "request");
        assert_eq!(records[1].get("url"), Some("/page"));
    }

    #[actix_web::test]
    async fn test_tee_copies_body() {
        let capture = Capture::new();
        let copy = SharedBuf::default();
        let sink = copy.clone();
        let app = test::init_service(
            App::new()
                .wrap(
                    LogRequest::new(Logger::new(capture.clone())).tee(move |req| {
                        (req.path() == "/teed").then(|| Box::new(sink.clone()) as Box<dyn io::Write>)
                    }),
                )
                .route("/teed", web::get().to(|| async { "copied body" }))
                .route("/plain", web::get().to(|| async { "not copied" })),
        )
        .await;

        for uri in ["/teed", "/plain"] {
            let res = test::call_service(&app, TestRequest::get().uri(uri).to_request()).await;
            test::read_body(res).await;
        }

        assert_eq!(&*copy.0.borrow(), b"copied body");
        let records = capture.at(log::Level::Info);
        assert_eq!(records[0].get("bytes"), Some("11"));
    }

    #[actix_web::test]
    async fn test_tee_failure_keeps_response() {
        let capture = Capture::new();
        let app = test::init_service(
            App::new()
                .wrap(
                    LogRequest::new(Logger::new(capture.clone()))
                        .tee(|_| Some(Box::new(BrokenBuf) as Box<dyn io::Write>)),
                )
                .route("/", web::get().to(|| async { "still here" })),
        )
        .await;

        let res = test::call_service(&app, TestRequest::get().uri("/").to_request()).await;
        assert_eq!(test::read_body(res).await.as_ref(), b"still here");

        let debug = capture.at(log::Level::Debug);
        assert_eq!(debug.len(), 1);
        assert_eq!(debug[0].message, "response tee failed");
        assert_eq!(debug[0].get("error"), Some("disk full"));

        let access = capture.at(log::Level::Info);
        assert_eq!(access[0].get("bytes"), Some("10"));
        assert_eq!(access[0].get("status"), Some("200"));
    }

    #[test]
    fn test_request_id_generation() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.to_string().len(), 36);
    }
}
