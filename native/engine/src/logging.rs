use std::{
    collections::BTreeMap,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context as _, Result};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::{Event, Instrument, Subscriber, info_span};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Context, Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::{
    events::{EngineEvent, EventBus},
    models::log::{LogEntry, LogKind, LogLevel, SpanInfo, SpanTrace},
};

const DEFAULT_FILTER: &str = "engine=debug,info";
const BATCH_SIZE: usize = 10;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Installs the global subscriber: a daily rotated file under `logs_dir` plus
/// [`LogForwardLayer`]. `RUST_LOG` overrides the default filter.
///
/// The returned guard flushes the file writer when dropped.
pub fn setup_logging(logs_dir: &Path, events: EventBus) -> Result<WorkerGuard> {
    fs_err::create_dir_all(logs_dir)?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(10)
        .filename_prefix("engine")
        .filename_suffix("log")
        .build(logs_dir)
        .context("Failed to initialize file appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let (forward_layer, receiver) = LogForwardLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .with(forward_layer)
        .try_init()
        .context("Failed to set global subscriber")?;

    LogForwardLayer::start_forwarder(receiver, events);
    Ok(guard)
}

/// Cached span field information stored in span extensions
#[derive(Clone, Debug)]
struct CachedSpanFields {
    parameters: BTreeMap<String, String>,
}

/// Turns events and span lifecycle into [`LogEntry`]s for the event bus.
pub struct LogForwardLayer {
    sender: Sender<LogEntry>,
}

impl LogForwardLayer {
    fn current_timestamp_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
    }

    pub fn new() -> (Self, Receiver<LogEntry>) {
        let (sender, receiver) = mpsc::channel(1000);
        (Self { sender }, receiver)
    }

    /// Publishes entries as [`EngineEvent::Log`] batches of up to ten, at least every 100ms.
    pub fn start_forwarder(receiver: Receiver<LogEntry>, events: EventBus) {
        tokio::spawn(
            async move {
                let batches = ReceiverStream::new(receiver).chunks_timeout(BATCH_SIZE, FLUSH_INTERVAL);
                tokio::pin!(batches);
                while let Some(batch) = batches.next().await {
                    events.publish(EngineEvent::Log(batch));
                }
            }
            .instrument(info_span!("task_log_forwarder")),
        );
    }

    fn send(&self, entry: LogEntry) {
        // Dropped when the forwarder falls behind; logging never blocks the engine
        let _ = self.sender.try_send(entry);
    }
}

fn collect_spans<'a, S>(scope: impl Iterator<Item = tracing_subscriber::registry::SpanRef<'a, S>>) -> Option<SpanTrace>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    let spans: Vec<SpanInfo> = scope
        .map(|span| SpanInfo {
            name: span.name().to_string(),
            target: span.metadata().target().to_string(),
            parameters: span
                .extensions()
                .get::<CachedSpanFields>()
                .map(|cached| cached.parameters.clone())
                .filter(|params| !params.is_empty()),
        })
        .collect();
    if spans.is_empty() { None } else { Some(SpanTrace { spans }) }
}

fn current_span_trace<S>(ctx: &Context<'_, S>) -> Option<SpanTrace>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    let id = ctx.current_span().id()?.clone();
    collect_spans(ctx.span_scope(&id)?.from_root())
}

/// Log records produced by the event bus itself would feed back into the bus.
fn is_own_event(target: &str) -> bool {
    target.starts_with("engine::events")
}

impl<S> Layer<S> for LogForwardLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if is_own_event(event.metadata().target()) {
            return;
        }
        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        let mut fields = visitor.fields;
        if let (Some(file), Some(line)) = (event.metadata().file(), event.metadata().line()) {
            fields.insert("location".to_string(), format!("{file}:{line}"));
        }

        self.send(LogEntry {
            timestamp: Self::current_timestamp_ms(),
            level: LogLevel::from(*event.metadata().level()),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            kind: LogKind::Event,
            fields: if fields.is_empty() { None } else { Some(fields) },
            span_trace: ctx.event_scope(event).and_then(|scope| collect_spans(scope.from_root())),
        });
    }

    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: Context<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else { return };
        if span.extensions().get::<CachedSpanFields>().is_some() {
            return;
        }

        let mut visitor = FieldVisitor::new();
        attrs.record(&mut visitor);
        if !visitor.fields.is_empty() {
            span.extensions_mut()
                .insert(CachedSpanFields { parameters: visitor.fields.clone() });
        }

        let mut fields = BTreeMap::new();
        if let (Some(file), Some(line)) = (attrs.metadata().file(), attrs.metadata().line()) {
            fields.insert("location".to_string(), format!("{file}:{line}"));
        }
        fields.extend(visitor.fields);

        self.send(LogEntry {
            timestamp: Self::current_timestamp_ms(),
            level: LogLevel::from(*attrs.metadata().level()),
            target: attrs.metadata().target().to_string(),
            message: format!("span::new {}::{}", attrs.metadata().target(), attrs.metadata().name()),
            kind: LogKind::SpanNew,
            fields: if fields.is_empty() { None } else { Some(fields) },
            span_trace: current_span_trace(&ctx),
        });
    }

    fn on_close(&self, id: tracing::span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(&id) else { return };
        self.send(LogEntry {
            timestamp: Self::current_timestamp_ms(),
            level: LogLevel::from(*span.metadata().level()),
            target: span.metadata().target().to_string(),
            message: format!("span::close {}::{}", span.metadata().target(), span.name()),
            kind: LogKind::SpanClose,
            fields: None,
            span_trace: current_span_trace(&ctx),
        });
    }
}

/// Visitor to extract fields from tracing events
struct FieldVisitor {
    message: Option<String>,
    fields: BTreeMap<String, String>,
}

impl FieldVisitor {
    fn new() -> Self {
        Self { message: None, fields: BTreeMap::new() }
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.fields.insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing::{info, info_span, warn};

    use super::*;

    fn capture(f: impl FnOnce()) -> Vec<LogEntry> {
        let (layer, mut receiver) = LogForwardLayer::new();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, f);
        let mut entries = Vec::new();
        while let Ok(entry) = receiver.try_recv() {
            entries.push(entry);
        }
        entries
    }

    #[test]
    fn events_carry_fields_and_span_parameters() {
        let entries = capture(|| {
            let span = info_span!("task", id = 7);
            let _enter = span.enter();
            warn!(package = "com.example.game", "Install failed");
        });

        let event = entries.iter().find(|e| e.kind == LogKind::Event).unwrap();
        assert_eq!(event.level, LogLevel::Warn);
        assert_eq!(event.message, "Install failed");
        let fields = event.fields.as_ref().unwrap();
        assert_eq!(fields["package"], "com.example.game");
        assert!(fields.contains_key("location"));

        let trace = event.span_trace.as_ref().unwrap();
        assert_eq!(trace.spans.len(), 1);
        assert_eq!(trace.spans[0].name, "task");
        assert_eq!(trace.spans[0].parameters.as_ref().unwrap()["id"], "7");
    }

    #[test]
    fn span_lifecycle_is_forwarded() {
        let entries = capture(|| {
            let span = info_span!("refresh");
            span.in_scope(|| info!("inside"));
        });

        let kinds: Vec<LogKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, [LogKind::SpanNew, LogKind::Event, LogKind::SpanClose]);
        assert!(entries[0].message.ends_with("::refresh"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn forwarder_publishes_batches() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let (layer, receiver) = LogForwardLayer::new();
        LogForwardLayer::start_forwarder(receiver, events.clone());

        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            for i in 0..3 {
                info!(i, "entry");
            }
        });

        let batch = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(EngineEvent::Log(batch)) = rx.recv().await {
                    break batch;
                }
            }
        })
        .await
        .unwrap();
        assert!(!batch.is_empty());
        assert!(batch.iter().all(|e| e.message == "entry"));
    }
}
