//! `tracing` layer feeding the log buffer.

use std::fmt::Write as _;
use std::sync::Arc;

use thinboot_core::log::{LogRecord, Severity};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::buffer::LogBuffer;

/// Targets whose events are never uplinked. The HTTP stack logs about
/// its own requests, and shipping those would feed the uplink with itself.
const SKIPPED_TARGETS: &[&str] = &["hyper", "reqwest", "h2", "rustls", "tokio_util"];

/// Converts every event into a [`LogRecord`] appended to the buffer.
#[derive(Debug, Clone)]
pub struct UplinkLayer {
    buffer: Arc<LogBuffer>,
}

impl UplinkLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

fn skipped(target: &str) -> bool {
    SKIPPED_TARGETS
        .iter()
        .any(|t| target == *t || target.strip_prefix(t).is_some_and(|rest| rest.starts_with("::")))
}

/// Renders the `message` field followed by the remaining fields as `k=v`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }

    fn push_field(&mut self, name: &str, value: std::fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", name, value);
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{}", value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.push_field(field.name(), format_args!("{:?}", value));
        }
    }
}

impl<S: Subscriber> Layer<S> for UplinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if skipped(metadata.target()) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.buffer
            .push(LogRecord::new(Severity::from(*metadata.level()), visitor.finish()));
    }
}
