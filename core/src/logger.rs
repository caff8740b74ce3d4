//! Log forwarding
//!
//! Hosts embedding the library receive log lines through a `CoreLogger`
//! callback; binaries use `init_fmt_logger` instead.

use std::fmt::Write;
use std::sync::{Arc, OnceLock};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};

/// Receives formatted log lines
pub trait CoreLogger: Send + Sync {
    fn log(&self, level: String, message: String);
}

// Set once by init_logger
static GLOBAL_LOGGER: OnceLock<Arc<dyn CoreLogger>> = OnceLock::new();

/// Layer that forwards every event to a `CoreLogger`
pub struct CallbackLayer {
    logger: Arc<dyn CoreLogger>,
}

impl CallbackLayer {
    pub fn new(logger: Arc<dyn CoreLogger>) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for CallbackLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = event.metadata().level().to_string();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.logger.log(level, visitor.finish());
    }
}

/// Message first, then the remaining fields as `name=value`
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={:?}", field.name(), value);
    }
}

/// Install `callback` as the global log sink.
///
/// Only the first call has an effect.
pub fn init_logger(callback: Box<dyn CoreLogger>) {
    if GLOBAL_LOGGER.set(Arc::from(callback)).is_err() {
        return;
    }
    let Some(logger) = GLOBAL_LOGGER.get() else {
        return;
    };

    let subscriber = tracing_subscriber::registry()
        .with(CallbackLayer::new(logger.clone()))
        .with(tracing_subscriber::filter::LevelFilter::DEBUG);

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Log to stderr, filtered by `RUST_LOG` or else `default_filter`
pub fn init_fmt_logger(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
