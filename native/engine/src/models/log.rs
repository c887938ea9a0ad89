use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogKind {
    Event,
    SpanNew,
    SpanClose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanInfo {
    pub name: String,
    pub target: String,
    pub parameters: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanTrace {
    pub spans: Vec<SpanInfo>,
}

/// A log record forwarded to event subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: u64,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    pub kind: LogKind,
    pub fields: Option<BTreeMap<String, String>>,
    pub span_trace: Option<SpanTrace>,
}
