use std::{
    any::Any,
    backtrace::Backtrace,
    cell::{OnceCell, RefCell},
    error::Error as StdError,
    future::Future,
    io,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    rc::Rc,
    sync::Once,
    task::{Context, Poll},
};

use pin_project_lite::pin_project;

use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::body::{BodySize, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::{Error, HttpMessage, Result};
use bytes::Bytes;

use crate::error::RecoveredPanic;
use crate::wrapper::{Field, Logger};

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

/// Keep the backtrace of every panic so [`Recoverer`] can log where the panic
/// happened rather than where it was caught.
///
/// Installs a panic hook in front of the current one. Only the first call has
/// an effect.
pub fn capture_panic_backtraces() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let _ = LAST_BACKTRACE.try_with(|slot| {
                *slot.borrow_mut() = Some(Backtrace::force_capture());
            });
            previous(info);
        }));
    });
}

fn take_backtrace() -> Option<Backtrace> {
    LAST_BACKTRACE
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
}

/// Readable message for a panic payload of any type.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(err) = payload.downcast_ref::<io::Error>() {
        err.to_string()
    } else if let Some(err) = payload.downcast_ref::<Box<dyn StdError + Send + Sync>>() {
        err.to_string()
    } else if let Some(err) = payload.downcast_ref::<Box<dyn StdError + Send>>() {
        err.to_string()
    } else {
        "panic payload of unknown type".to_string()
    }
}

/// Slot through which the logging middleware hands its per-request logger to
/// an enclosing [`Recoverer`].
pub(crate) struct LoggerCell(Rc<OnceCell<Logger>>);

impl LoggerCell {
    pub(crate) fn fill(&self, logger: Logger) {
        let _ = self.0.set(logger);
    }
}

/// Middleware turning panics in the wrapped services into
/// `500 Internal Server Error` responses.
///
/// The panic is logged at error level with the message `panic`, an `error`
/// field holding the panic payload and a `stack` field holding a backtrace.
/// The record goes through the per-request logger when a [`LogRequest`]
/// inside this middleware created one, through the base logger otherwise.
/// The client only sees the standard reason phrase.
///
/// Wrap it outside of [`LogRequest`] so panics in the logging stage are
/// recovered as well:
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_reqlog::{LogRequest, Logger, Recoverer};
///
/// let base = Logger::global();
/// let app = App::new()
///     .wrap(LogRequest::new(base.clone()))
///     .wrap(Recoverer::new(base));
/// ```
///
/// Errors returned by the wrapped services are passed through untouched.
///
/// A panic while the response body streams is logged the same way. The status
/// line is already out by then, so the body ends with an error instead.
///
/// [`LogRequest`]: crate::LogRequest
#[derive(Clone)]
pub struct Recoverer {
    base: Logger,
}

impl Recoverer {
    pub fn new(base: Logger) -> Self {
        Recoverer { base }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Recoverer
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<RecoveredBody<B>>;
    type Error = Error;
    type Transform = RecovererService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RecovererService {
            service,
            base: self.base.clone(),
        }))
    }
}

/// Recovery middleware service.
pub struct RecovererService<S> {
    service: S,
    base: Logger,
}

impl<S, B> Service<ServiceRequest> for RecovererService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<RecoveredBody<B>>;
    type Error = Error;
    type Future = RecovererResponse<S, B>;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let cell = Rc::new(OnceCell::new());
        req.extensions_mut().insert(LoggerCell(Rc::clone(&cell)));

        let scope = PanicScope {
            cell,
            base: self.base.clone(),
        };

        match panic::catch_unwind(AssertUnwindSafe(|| self.service.call(req))) {
            Ok(fut) => RecovererResponse {
                fut: Some(fut),
                recovered: None,
                scope,
                _phantom: PhantomData,
            },
            Err(payload) => {
                let recovered = scope.recover(payload);
                RecovererResponse {
                    fut: None,
                    recovered: Some(recovered),
                    scope,
                    _phantom: PhantomData,
                }
            }
        }
    }
}

/// Everything needed to report a panic of one request.
#[derive(Clone)]
struct PanicScope {
    cell: Rc<OnceCell<Logger>>,
    base: Logger,
}

impl PanicScope {
    fn recover(&self, payload: Box<dyn Any + Send>) -> Error {
        self.report(payload);
        RecoveredPanic.into()
    }

    fn report(&self, payload: Box<dyn Any + Send>) {
        let logger = self.cell.get().unwrap_or(&self.base);
        let stack = take_backtrace().unwrap_or_else(Backtrace::force_capture);

        logger.error(
            "panic",
            &[
                Field::str("error", panic_message(&*payload)),
                Field::str("stack", stack.to_string()),
            ],
        );
    }
}

pin_project! {
    pub struct RecovererResponse<S, B>
    where
        S: Service<ServiceRequest>,
    {
        #[pin]
        fut: Option<S::Future>,
        recovered: Option<Error>,
        scope: PanicScope,
        _phantom: PhantomData<B>,
    }
}

impl<S, B> Future for RecovererResponse<S, B>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Output = Result<ServiceResponse<RecoveredBody<B>>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        if let Some(err) = this.recovered.take() {
            return Poll::Ready(Err(err));
        }

        let Some(fut) = this.fut.as_mut().as_pin_mut() else {
            return Poll::Pending;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| fut.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(Err(err))) => Poll::Ready(Err(err)),
            Ok(Poll::Ready(Ok(res))) => {
                let scope = this.scope.clone();
                Poll::Ready(Ok(res.map_body(move |_, body| RecoveredBody {
                    body,
                    scope,
                    done: false,
                })))
            }
            Err(payload) => {
                this.fut.set(None);
                Poll::Ready(Err(this.scope.recover(payload)))
            }
        }
    }
}

pin_project! {
    /// Response body that turns a panic while streaming into a logged error
    /// and a body error.
    pub struct RecoveredBody<B> {
        #[pin]
        body: B,
        scope: PanicScope,
        done: bool,
    }
}

impl<B: MessageBody> MessageBody for RecoveredBody<B> {
    type Error = Box<dyn StdError>;

    #[inline]
    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        let mut body = this.body;
        match panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll_next(cx))) {
            Ok(Poll::Ready(Some(Err(err)))) => Poll::Ready(Some(Err(err.into()))),
            Ok(Poll::Ready(Some(Ok(chunk)))) => Poll::Ready(Some(Ok(chunk))),
            Ok(Poll::Ready(None)) => Poll::Ready(None),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => {
                *this.done = true;
                this.scope.report(payload);
                let err: Self::Error = Box::new(RecoveredPanic);
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}
