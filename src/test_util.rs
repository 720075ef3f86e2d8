use std::sync::{Arc, Mutex};

/// Owned copy of a `log::Record`.
#[derive(Debug, Clone)]
pub struct Captured {
    pub level: log::Level,
    pub target: String,
    pub message: String,
    pub file: Option<String>,
    pub kvs: Vec<(String, String)>,
}

impl Captured {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.kvs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Backend that keeps every record in memory.
pub struct Capture {
    level: log::LevelFilter,
    records: Mutex<Vec<Captured>>,
}

impl Capture {
    pub fn new() -> Arc<Self> {
        Capture::with_level(log::LevelFilter::Trace)
    }

    pub fn with_level(level: log::LevelFilter) -> Arc<Self> {
        Arc::new(Capture {
            level,
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn records(&self) -> Vec<Captured> {
        self.records.lock().unwrap().clone()
    }

    pub fn at(&self, level: log::Level) -> Vec<Captured> {
        self.records()
            .into_iter()
            .filter(|r| r.level == level)
            .collect()
    }
}

struct Collect<'a>(&'a mut Vec<(String, String)>);

impl<'kvs> log::kv::VisitSource<'kvs> for Collect<'_> {
    fn visit_pair(
        &mut self,
        key: log::kv::Key<'kvs>,
        value: log::kv::Value<'kvs>,
    ) -> Result<(), log::kv::Error> {
        self.0.push((key.as_str().to_string(), value.to_string()));
        Ok(())
    }
}

impl log::Log for Capture {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut kvs = Vec::new();
        let _ = record.key_values().visit(&mut Collect(&mut kvs));
        self.records.lock().unwrap().push(Captured {
            level: record.level(),
            target: record.target().to_string(),
            message: record.args().to_string(),
            file: record.file().map(str::to_string),
            kvs,
        });
    }

    fn flush(&self) {}
}
