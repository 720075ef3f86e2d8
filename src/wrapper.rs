use std::borrow::Cow;
use std::convert::Infallible;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use actix_utils::future::{Ready, ready};
use actix_web::dev::Payload;
use actix_web::{FromRequest, HttpMessage, HttpRequest};
use log::kv::ToValue;

/// A typed value attached to a log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Int(i64),
    Uint(u64),
}

impl Value {
    fn to_kv(&self) -> log::kv::Value<'_> {
        match self {
            Value::Str(s) => s.as_str().to_value(),
            Value::Int(n) => n.to_value(),
            Value::Uint(n) => n.to_value(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(n) => write!(f, "{n}"),
            Value::Uint(n) => write!(f, "{n}"),
        }
    }
}

/// Key and value of a structured log field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub key: Cow<'static, str>,
    pub value: Value,
}

impl Field {
    pub fn str(key: impl Into<Cow<'static, str>>, value: impl Into<String>) -> Self {
        Field {
            key: key.into(),
            value: Value::Str(value.into()),
        }
    }

    pub fn int(key: impl Into<Cow<'static, str>>, value: i64) -> Self {
        Field {
            key: key.into(),
            value: Value::Int(value),
        }
    }

    pub fn uint(key: impl Into<Cow<'static, str>>, value: u64) -> Self {
        Field {
            key: key.into(),
            value: Value::Uint(value),
        }
    }
}

#[derive(Clone)]
enum Sink {
    /// Whatever is registered with the `log` facade.
    Global,
    Shared(Arc<dyn log::Log>),
}

/// Structured logger handle.
///
/// A `Logger` carries a log target and a list of persistent fields that are
/// attached to every record it emits. [`with`](Logger::with) derives a child
/// logger with one more field; the parent is never modified, so a single base
/// logger can be shared by all workers while each request gets its own child.
///
/// Records go to the `log` facade by default, or to an explicit backend given
/// to [`Logger::new`].
///
/// Inside a request wrapped by [`LogRequest`](crate::LogRequest) the
/// per-request logger can be taken as a handler argument:
/// ```rust
/// use actix_web::{web, App};
/// use actix_web_middleware_reqlog::{Field, Logger};
///
/// async fn item(log: Logger, path: web::Path<u32>) -> String {
///     log.info("loading item", &[Field::uint("item", u64::from(*path))]);
///     format!("item {path}")
/// }
///
/// let app = App::new().route("/items/{id}", web::get().to(item));
/// ```
#[derive(Clone)]
pub struct Logger {
    sink: Sink,
    target: Cow<'static, str>,
    fields: Arc<[Field]>,
}

impl Logger {
    /// Logger writing to `backend` instead of the `log` facade.
    pub fn new(backend: Arc<dyn log::Log>) -> Self {
        Logger {
            sink: Sink::Shared(backend),
            target: Cow::Borrowed(module_path!()),
            fields: Arc::from(Vec::new()),
        }
    }

    /// Logger writing to the `log` facade.
    pub fn global() -> Self {
        Logger {
            sink: Sink::Global,
            target: Cow::Borrowed(module_path!()),
            fields: Arc::from(Vec::new()),
        }
    }

    /// Child logger that also carries `field`.
    pub fn with(&self, field: Field) -> Self {
        let mut fields = self.fields.to_vec();
        fields.push(field);
        Logger {
            sink: self.sink.clone(),
            target: self.target.clone(),
            fields: fields.into(),
        }
    }

    /// Child logger that logs under `target`.
    pub fn with_target(&self, target: impl Into<Cow<'static, str>>) -> Self {
        Logger {
            sink: self.sink.clone(),
            target: target.into(),
            fields: Arc::clone(&self.fields),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Persistent fields, oldest first.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Value of the persistent field named `key`.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields
            .iter()
            .rev()
            .find(|f| f.key == key)
            .map(|f| &f.value)
    }

    fn backend(&self) -> &dyn log::Log {
        match &self.sink {
            Sink::Global => log::logger(),
            Sink::Shared(backend) => backend.as_ref(),
        }
    }

    /// Emit `msg` at `level` with the persistent fields followed by `fields`.
    #[track_caller]
    pub fn log(&self, level: log::Level, msg: &str, fields: &[Field]) {
        if matches!(self.sink, Sink::Global) && level > log::max_level() {
            return;
        }

        let backend = self.backend();
        let metadata = log::Metadata::builder()
            .level(level)
            .target(&self.target)
            .build();
        if !backend.enabled(&metadata) {
            return;
        }

        let loc = Location::caller();
        let kvs: Vec<(&str, log::kv::Value)> = self
            .fields
            .iter()
            .chain(fields)
            .map(|f| (f.key.as_ref(), f.value.to_kv()))
            .collect();
        let kvs = kvs.as_slice();

        backend.log(
            &log::Record::builder()
                .args(format_args!("{msg}"))
                .level(level)
                .target(&self.target)
                .file_static(Some(loc.file()))
                .line(Some(loc.line()))
                .key_values(&kvs)
                .build(),
        );
    }

    #[track_caller]
    pub fn error(&self, msg: &str, fields: &[Field]) {
        self.log(log::Level::Error, msg, fields)
    }

    #[track_caller]
    pub fn warn(&self, msg: &str, fields: &[Field]) {
        self.log(log::Level::Warn, msg, fields)
    }

    #[track_caller]
    pub fn info(&self, msg: &str, fields: &[Field]) {
        self.log(log::Level::Info, msg, fields)
    }

    #[track_caller]
    pub fn debug(&self, msg: &str, fields: &[Field]) {
        self.log(log::Level::Debug, msg, fields)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::global()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("target", &self.target)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

/// Per-request logger if the request went through `LogRequest`, otherwise a
/// `Logger` registered with `App::app_data`, otherwise the `log` facade.
impl FromRequest for Logger {
    type Error = Infallible;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let logger = req
            .extensions()
            .get::<Logger>()
            .cloned()
            .or_else(|| req.app_data::<Logger>().cloned())
            .unwrap_or_default();
        ready(Ok(logger))
    }
}
