use std::io::{self, Write as _};

use actix_web::HttpResponse;
use actix_web::http::StatusCode;
use bytes::{Bytes, BytesMut};

/// Outbound side of a response: a status that can be sent once, then body bytes.
pub trait ResponseSink {
    /// Fix and send the response status.
    fn commit_header(&mut self, status: StatusCode);

    /// Write body bytes, returning how many were accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl<S: ResponseSink + ?Sized> ResponseSink for &mut S {
    fn commit_header(&mut self, status: StatusCode) {
        (**self).commit_header(status)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }
}

impl<S: ResponseSink + ?Sized> ResponseSink for Box<S> {
    fn commit_header(&mut self, status: StatusCode) {
        (**self).commit_header(status)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }
}

/// Wrapper around a [`ResponseSink`] that records what was sent through it.
///
/// The observer keeps the sink's contract: the first committed status wins and
/// writing body bytes before any status commits `200 OK`. Along the way it
/// records the final status and the number of bytes the sink accepted.
///
/// A secondary writer can be attached with [`set_tee`](Self::set_tee); every
/// byte the sink accepts is then copied into it, in order. Tee failures never
/// turn a successful write into an error, they are kept for
/// [`take_tee_error`](Self::take_tee_error).
///
/// The observer is owned by a single request and is deliberately `!Sync`.
///
/// # Examples
/// ```rust
/// use actix_web::http::StatusCode;
/// use actix_web_middleware_reqlog::{BufferedResponse, ResponseObserver};
///
/// let mut w = ResponseObserver::new(BufferedResponse::default());
/// w.write(b"ok").unwrap();
/// w.commit_header(StatusCode::NOT_FOUND);
///
/// assert_eq!(w.status(), Some(StatusCode::OK));
/// assert_eq!(w.bytes_written(), 2);
/// ```
pub struct ResponseObserver<S> {
    inner: S,
    status: Option<StatusCode>,
    bytes: usize,
    tee: Option<Box<dyn io::Write>>,
    tee_error: Option<io::Error>,
}

impl<S: ResponseSink> ResponseObserver<S> {
    pub fn new(inner: S) -> Self {
        ResponseObserver {
            inner,
            status: None,
            bytes: 0,
            tee: None,
            tee_error: None,
        }
    }

    /// Commit `status` unless a status was already committed, in which case
    /// the call is ignored.
    pub fn commit_header(&mut self, status: StatusCode) {
        if self.status.is_none() {
            self.status = Some(status);
            self.inner.commit_header(status);
        }
    }

    /// Write `buf` through to the sink once and return the accepted length.
    ///
    /// An error from the sink is returned as is and nothing is counted or
    /// teed.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.commit_header(StatusCode::OK);

        let n = self.inner.write(buf)?.min(buf.len());
        self.bytes += n;

        if let Some(tee) = self.tee.as_mut() {
            if let Err(err) = tee.write_all(&buf[..n]) {
                self.tee_error = Some(err);
            }
        }

        Ok(n)
    }

    /// Commit `200 OK` if the handler never committed a status.
    pub fn finalize(&mut self) {
        self.commit_header(StatusCode::OK);
    }

    /// Committed status, `None` until a status is committed.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Total bytes accepted by the sink.
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Copy the body into `tee` as well. Replaces any earlier tee.
    pub fn set_tee(&mut self, tee: Box<dyn io::Write>) {
        self.tee = Some(tee);
    }

    /// Last tee failure since the previous call, if any.
    pub fn take_tee_error(&mut self) -> Option<io::Error> {
        self.tee_error.take()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Direct access to the sink. Anything done through it is not recorded.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ResponseSink + Default> Default for ResponseObserver<S> {
    fn default() -> Self {
        ResponseObserver::new(S::default())
    }
}

impl<S: ResponseSink> io::Write for ResponseObserver<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ResponseObserver::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.tee.as_mut() {
            Some(tee) => tee.flush(),
            None => Ok(()),
        }
    }
}

/// Accounting end of a streamed actix body.
///
/// actix sends the chunks itself once the body yields them, so every write is
/// accepted in full.
#[derive(Debug, Default)]
pub struct BodyStream {
    status: Option<StatusCode>,
    chunks: usize,
}

impl BodyStream {
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Number of body chunks seen so far.
    pub fn chunks(&self) -> usize {
        self.chunks
    }
}

impl ResponseSink for BodyStream {
    fn commit_header(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.chunks += 1;
        Ok(buf.len())
    }
}

/// In-memory response for handlers that would rather write than build.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    status: Option<StatusCode>,
    body: BytesMut,
}

impl BufferedResponse {
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Turn the collected status and body into a response. A response with
    /// no committed status is `200 OK`.
    pub fn into_response(self) -> HttpResponse<Bytes> {
        HttpResponse::with_body(self.status.unwrap_or(StatusCode::OK), self.body.freeze())
    }
}

impl ResponseSink for BufferedResponse {
    fn commit_header(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }
}
