//! Log backend selected once at process start.
//!
//! Records go through a `structured_logger` logger whose writer renders one of
//! two formats:
//! - development: one tab separated line per record, for humans,
//! - production: one JSON object per line, for log shippers.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use log::kv::{Key, Value};
use serde_json::{Map, Value as Json};
use structured_logger::Builder;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::InitError;
use crate::wrapper::Logger;

/// Register the backend for `debug` with the `log` facade and return the
/// base logger.
///
/// Call it once, before the server starts. A second call fails.
pub fn init_logger(debug: bool) -> Result<Logger, InitError> {
    Config::new(debug).init()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Development,
    Production,
}

/// Backend configuration.
pub struct Config {
    format: Format,
    level: log::LevelFilter,
    writer: Box<dyn Write + Send>,
}

impl Config {
    /// Development format at `Debug` level when `debug` is set, production
    /// format at `Info` level otherwise. Output goes to stderr.
    pub fn new(debug: bool) -> Self {
        let (format, level) = if debug {
            (Format::Development, log::LevelFilter::Debug)
        } else {
            (Format::Production, log::LevelFilter::Info)
        };
        Config {
            format,
            level,
            writer: Box::new(io::stderr()),
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn level(mut self, level: log::LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn writer(mut self, writer: impl Write + Send + 'static) -> Self {
        self.writer = Box::new(writer);
        self
    }

    /// Build the backend without registering it anywhere.
    pub fn build(self) -> impl log::Log + 'static {
        let writer = LineWriter {
            format: self.format,
            out: Mutex::new(self.writer),
        };
        Builder::with_level(self.level.as_str())
            .with_target_writer("*", Box::new(writer))
            .build()
    }

    /// Build the backend, register it with the `log` facade and return a base
    /// logger over it.
    pub fn init(self) -> Result<Logger, InitError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self.build()))?;
        log::set_max_level(level);
        Ok(Logger::global())
    }
}

/// Keys `structured_logger` fills in on every record.
const LEVEL: &str = "level";
const MESSAGE: &str = "message";
const TARGET: &str = "target";
const TIMESTAMP: &str = "timestamp";
const FILE: &str = "file";
const LINE: &str = "line";

/// `structured_logger` writer rendering records in one [`Format`].
struct LineWriter {
    format: Format,
    out: Mutex<Box<dyn Write + Send>>,
}

impl LineWriter {
    fn render(&self, record: &BTreeMap<Key<'_>, Value<'_>>, now: OffsetDateTime) -> String {
        let timestamp = now
            .format(&Rfc3339)
            .unwrap_or_else(|_| now.unix_timestamp_nanos().to_string());

        let (mut level, mut target, mut msg) = (String::new(), String::new(), String::new());
        let (mut file, mut line) = (None, None);
        let mut fields = Map::new();
        for (key, value) in record {
            match key.as_str() {
                LEVEL => level = value.to_string(),
                TARGET => target = value.to_string(),
                MESSAGE => msg = value.to_string(),
                FILE => file = Some(value.to_string()),
                LINE => line = Some(value.to_string()),
                TIMESTAMP => {}
                other => {
                    fields.insert(other.to_string(), to_json(value));
                }
            }
        }
        let caller = match (file, line) {
            (Some(file), Some(line)) => format!("{file}:{line}"),
            (Some(file), None) => file,
            _ => String::new(),
        };

        match self.format {
            Format::Development => {
                let mut out = format!(
                    "{timestamp}\t{}\t{target}\t{caller}\t{msg}",
                    level.to_ascii_uppercase()
                );
                if !fields.is_empty() {
                    out.push('\t');
                    out.push_str(&Json::Object(fields).to_string());
                }
                out
            }
            Format::Production => {
                let mut object = Map::new();
                object.insert("timestamp".into(), timestamp.into());
                object.insert("lvl".into(), level.to_ascii_lowercase().into());
                object.insert("logger".into(), target.into());
                if !caller.is_empty() {
                    object.insert("caller".into(), caller.into());
                }
                object.insert("msg".into(), msg.into());
                object.extend(fields);
                Json::Object(object).to_string()
            }
        }
    }
}

impl structured_logger::Writer for LineWriter {
    fn write_log(&self, value: &BTreeMap<Key<'_>, Value<'_>>) -> Result<(), io::Error> {
        let line = self.render(value, OffsetDateTime::now_utc());
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}")?;
        out.flush()
    }
}

fn to_json(value: &Value) -> Json {
    if let Some(n) = value.to_u64() {
        Json::from(n)
    } else if let Some(n) = value.to_i64() {
        Json::from(n)
    } else if let Some(b) = value.to_bool() {
        Json::from(b)
    } else if let Some(s) = value.to_borrowed_str() {
        Json::from(s)
    } else {
        Json::from(value.to_string())
    }
}
