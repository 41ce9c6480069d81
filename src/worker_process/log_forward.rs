//! Forward child-side tracing events to the parent as `log` messages

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::protocol::ChildMessage;

fn rank(level: &Level) -> u8 {
    match *level {
        Level::ERROR => 1,
        Level::WARN => 2,
        Level::INFO => 3,
        Level::DEBUG => 4,
        Level::TRACE => 5,
    }
}

/// Parse a level name, accepting the usual aliases
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Shared, adjustable threshold. The child raises or lowers it once `init`
/// tells it which level the parent wants.
#[derive(Debug, Clone)]
pub struct LevelHandle(Arc<AtomicU8>);

impl LevelHandle {
    pub fn new(level: Level) -> Self {
        Self(Arc::new(AtomicU8::new(rank(&level))))
    }

    pub fn set(&self, level: Level) {
        self.0.store(rank(&level), Ordering::Relaxed);
    }

    pub fn enabled(&self, level: &Level) -> bool {
        rank(level) <= self.0.load(Ordering::Relaxed)
    }
}

/// Collects the `message` field plus any structured fields as `k=v`
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

pub struct ForwardingLayer {
    tx: UnboundedSender<ChildMessage>,
    level: LevelHandle,
}

impl ForwardingLayer {
    pub fn new(tx: UnboundedSender<ChildMessage>, level: LevelHandle) -> Self {
        Self { tx, level }
    }
}

impl<S: Subscriber> Layer<S> for ForwardingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !self.level.enabled(meta.level()) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let module = meta.module_path().unwrap_or_else(|| meta.target());
        // Parent gone: nothing left to forward to
        let _ = self.tx.send(ChildMessage::Log {
            level: meta.level().as_str().to_ascii_lowercase(),
            module: module.to_string(),
            message: visitor.message + &visitor.fields,
        });
    }
}
