//! Status messages and the sinks they are written to.
//!
//! Sinks are fire-and-forget: a failing or slow sink must never affect the
//! outcome of an await.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub severity: Severity,
    pub text: String,
}

impl Message {
    pub fn new(severity: Severity, text: impl Into<String>) -> Self {
        Self { severity, text: text.into() }
    }
    pub fn info(text: impl Into<String>) -> Self {
        Self::new(Severity::Info, text)
    }
    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(Severity::Warning, text)
    }
    pub fn error(text: impl Into<String>) -> Self {
        Self::new(Severity::Error, text)
    }
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Messages(pub Vec<Message>);

impl Messages {
    pub fn push(&mut self, m: Message) {
        self.0.push(m);
    }
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.0.iter()
    }
    pub fn warnings(&self) -> impl Iterator<Item = &Message> {
        self.0.iter().filter(|m| m.severity == Severity::Warning)
    }
    pub fn errors(&self) -> impl Iterator<Item = &Message> {
        self.0.iter().filter(|m| m.severity == Severity::Error)
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Message> for Messages {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Destination for user-facing progress output.
pub trait StatusSink: Send + Sync {
    fn log_status(&self, severity: Severity, message: &str);

    fn log_message(&self, message: &Message) {
        self.log_status(message.severity, &message.text);
    }
}

/// Emits status lines as tracing events.
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    pub context: String,
}

impl TracingSink {
    pub fn new(context: impl Into<String>) -> Self {
        Self { context: context.into() }
    }
}

impl StatusSink for TracingSink {
    fn log_status(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Debug => debug!(ctx = %self.context, "{}", message),
            Severity::Info => info!(ctx = %self.context, "{}", message),
            Severity::Warning => warn!(ctx = %self.context, "{}", message),
            Severity::Error => error!(ctx = %self.context, "{}", message),
        }
    }
}

/// Records every message; used for reports and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<Message>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.text.contains(needle))
    }
}

impl StatusSink for MemorySink {
    fn log_status(&self, severity: Severity, message: &str) {
        if let Ok(mut e) = self.entries.lock() {
            e.push(Message::new(severity, message));
        }
    }
}

/// Wraps a sink and drops a status line identical to the previous one.
pub struct DedupLogger<S: ?Sized = dyn StatusSink> {
    last: Mutex<Option<Message>>,
    inner: std::sync::Arc<S>,
}

impl<S: StatusSink + ?Sized> DedupLogger<S> {
    pub fn new(inner: std::sync::Arc<S>) -> Self {
        Self { last: Mutex::new(None), inner }
    }
}

impl<S: StatusSink + ?Sized> StatusSink for DedupLogger<S> {
    fn log_status(&self, severity: Severity, message: &str) {
        let msg = Message::new(severity, message);
        if let Ok(mut last) = self.last.lock() {
            if last.as_ref() == Some(&msg) {
                return;
            }
            *last = Some(msg);
        }
        self.inner.log_status(severity, message);
    }
}
