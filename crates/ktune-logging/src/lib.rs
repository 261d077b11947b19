//! Process logging bootstrap for ktune.
//!
//! `log` records are bridged into `tracing`, filtered by `RUST_LOG` (or
//! `KTUNE_LOG`), and forwarded to optional process-wide hooks: one receives
//! every event as a [`RuntimeLogRecord`], the other receives a [`SpanRecord`]
//! with the wall time of each closed span (tuning searches run inside
//! `ktune.tune` spans).

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::subscriber::DefaultGuard;
use tracing::Subscriber;
use tracing_log::LogTracer;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

pub const LOG_ENV: &str = "KTUNE_LOG";

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeLogRecord {
    pub ts: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<JsonValue>,
}

/// A span that has closed, with the fields it was opened with.
#[derive(Debug, Clone, Serialize)]
pub struct SpanRecord {
    pub name: String,
    pub target: String,
    pub started: String,
    pub elapsed_micros: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<JsonValue>,
}

type LogHook = Arc<dyn Fn(&RuntimeLogRecord) + Send + Sync>;
type SpanHook = Arc<dyn Fn(&SpanRecord) + Send + Sync>;

static LOG_HOOK: Lazy<RwLock<Option<LogHook>>> = Lazy::new(|| RwLock::new(None));
static SPAN_HOOK: Lazy<RwLock<Option<SpanHook>>> = Lazy::new(|| RwLock::new(None));

pub struct LoggingGuard {
    thread_default: Option<DefaultGuard>,
}

impl LoggingGuard {
    /// False when another global subscriber was already installed and this
    /// one only applies to the calling thread.
    pub fn is_global(&self) -> bool {
        self.thread_default.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Directive used when neither `RUST_LOG` nor `KTUNE_LOG` is set.
    pub default_directive: String,
    /// Also write formatted lines to stderr.
    pub stderr: bool,
    /// Report closed spans to the span hook.
    pub span_timings: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            stderr: false,
            span_timings: true,
        }
    }
}

/// Replaces any previously installed log hook.
pub fn set_runtime_log_hook<F>(hook: F)
where
    F: Fn(&RuntimeLogRecord) + Send + Sync + 'static,
{
    if let Ok(mut slot) = LOG_HOOK.write() {
        *slot = Some(Arc::new(hook));
    }
}

pub fn clear_runtime_log_hook() {
    if let Ok(mut slot) = LOG_HOOK.write() {
        *slot = None;
    }
}

/// Replaces any previously installed span hook.
pub fn set_span_hook<F>(hook: F)
where
    F: Fn(&SpanRecord) + Send + Sync + 'static,
{
    if let Ok(mut slot) = SPAN_HOOK.write() {
        *slot = Some(Arc::new(hook));
    }
}

pub fn clear_span_hook() {
    if let Ok(mut slot) = SPAN_HOOK.write() {
        *slot = None;
    }
}

fn log_hook() -> Option<LogHook> {
    LOG_HOOK.read().ok().and_then(|slot| slot.clone())
}

fn span_hook() -> Option<SpanHook> {
    SPAN_HOOK.read().ok().and_then(|slot| slot.clone())
}

pub fn init_logging(opts: LoggingOptions) -> LoggingGuard {
    // Route log:: macros into tracing
    let _ = LogTracer::init();

    let guard = match tracing::subscriber::set_global_default(build_subscriber(&opts)) {
        Ok(()) => None,
        Err(_) => Some(tracing::subscriber::set_default(build_subscriber(&opts))),
    };

    LoggingGuard {
        thread_default: guard,
    }
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(LOG_ENV))
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn build_subscriber(opts: &LoggingOptions) -> impl Subscriber + Send + Sync + 'static {
    let span_layer = opts.span_timings.then_some(SpanTimingLayer);
    let stderr_layer = opts.stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .compact()
    });
    tracing_subscriber::registry()
        .with(env_filter(&opts.default_directive))
        .with(LogBridgeLayer)
        .with(span_layer)
        .with(stderr_layer)
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

struct LogBridgeLayer;

impl<S> Layer<S> for LogBridgeLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let Some(hook) = log_hook() else {
            return;
        };
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();

        let record = RuntimeLogRecord {
            ts: now_rfc3339(),
            level: meta.level().to_string(),
            target: visitor
                .log_target
                .take()
                .unwrap_or_else(|| meta.target().to_string()),
            message: visitor
                .message
                .take()
                .unwrap_or_else(|| meta.name().to_string()),
            span: ctx.event_span(event).map(|span| span.name().to_string()),
            fields: visitor.into_fields(),
        };
        hook(&record);
    }
}

struct SpanStart {
    at: Instant,
    ts: String,
    fields: Option<JsonValue>,
}

struct SpanTimingLayer;

impl<S> Layer<S> for SpanTimingLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: Context<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(SpanStart {
            at: Instant::now(),
            ts: now_rfc3339(),
            fields: visitor.into_fields(),
        });
    }

    fn on_close(&self, id: tracing::span::Id, ctx: Context<'_, S>) {
        let Some(hook) = span_hook() else {
            return;
        };
        let Some(span) = ctx.span(&id) else {
            return;
        };
        let record = {
            let extensions = span.extensions();
            let Some(start) = extensions.get::<SpanStart>() else {
                return;
            };
            SpanRecord {
                name: span.name().to_string(),
                target: span.metadata().target().to_string(),
                started: start.ts.clone(),
                elapsed_micros: i64::try_from(start.at.elapsed().as_micros()).unwrap_or(i64::MAX),
                fields: start.fields.clone(),
            }
        };
        hook(&record);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    log_target: Option<String>,
    fields: Map<String, JsonValue>,
}

impl JsonVisitor {
    fn insert(&mut self, name: &str, value: JsonValue) {
        match name {
            "message" => {
                self.message = Some(match value {
                    JsonValue::String(text) => text,
                    other => other.to_string(),
                })
            }
            // Set by tracing-log on records bridged from the log facade
            "log.target" => self.log_target = value.as_str().map(str::to_string),
            "log.module_path" | "log.file" | "log.line" => {}
            _ => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }

    fn into_fields(self) -> Option<JsonValue> {
        (!self.fields.is_empty()).then_some(JsonValue::Object(self.fields))
    }
}

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.insert(field.name(), JsonValue::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.insert(field.name(), JsonValue::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.insert(field.name(), JsonValue::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.insert(field.name(), JsonValue::from(value));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.insert(field.name(), JsonValue::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.insert(field.name(), JsonValue::Bool(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visitor_separates_message_and_fields() {
        let mut visitor = JsonVisitor::default();
        visitor.insert("message", JsonValue::String("tuned".into()));
        visitor.insert("log.target", JsonValue::String("ktune::tuning".into()));
        visitor.insert("log.line", JsonValue::from(12));
        visitor.insert("candidates", JsonValue::from(9));
        assert_eq!(visitor.message.as_deref(), Some("tuned"));
        assert_eq!(visitor.log_target.as_deref(), Some("ktune::tuning"));
        let fields = visitor.into_fields().expect("fields");
        assert_eq!(fields, serde_json::json!({ "candidates": 9 }));
    }

    #[test]
    fn empty_visitor_has_no_fields() {
        assert!(JsonVisitor::default().into_fields().is_none());
    }

    #[test]
    fn default_options_report_spans_quietly() {
        let opts = LoggingOptions::default();
        assert_eq!(opts.default_directive, "info");
        assert!(!opts.stderr);
        assert!(opts.span_timings);
    }
}
