//! NDJSON logging with per-context filtering.
//!
//! Every record is one JSON line: `{timestamp, logLevel, context, message,
//! details}`. The context is the tracing target; crawl code always logs with
//! an explicit target from the closed context set, so `logContext` /
//! `logExcludeContext` compile directly to target filters.
//!
//! Log files land in `<collection>/logs/crawl-<utc-compact>.log`; the same
//! stream is mirrored to stdout.

use std::io::Write;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::CrawlConfig;

/// The closed set of log contexts.
pub const LOG_CONTEXTS: &[&str] = &[
    "general",
    "worker",
    "state",
    "links",
    "behavior",
    "sitemap",
    "pageStatus",
    "crawlStatus",
    "driver",
    "storage",
];

struct RecordVisitor {
    message: String,
    details: Map<String, Value>,
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.details
                .insert(field.name().to_string(), Value::String(format!("{:?}", value)));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.details
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.details.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.details.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.details.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.details.insert(field.name().to_string(), value.into());
    }
}

/// Renders events as NDJSON records onto any writer.
pub struct NdjsonLayer<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send + 'static> NdjsonLayer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<S, W> Layer<S> for NdjsonLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: Write + Send + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = RecordVisitor {
            message: String::new(),
            details: Map::new(),
        };
        event.record(&mut visitor);

        // A `fatal` marker field upgrades the error level in the record.
        let fatal = visitor
            .details
            .remove("fatal")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let level = if fatal {
            "fatal"
        } else {
            let level = *event.metadata().level();
            if level == Level::ERROR {
                "error"
            } else if level == Level::WARN {
                "warn"
            } else if level == Level::INFO {
                "info"
            } else {
                "debug"
            }
        };

        let record = json!({
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "logLevel": level,
            "context": event.metadata().target(),
            "message": visitor.message,
            "details": Value::Object(visitor.details),
        });
        let mut writer = self.writer.lock();
        let _ = writeln!(writer, "{}", record);
    }
}

/// Build the target filter from the logging config.
pub fn build_filter(config: &CrawlConfig) -> Targets {
    let level = if config.logging.iter().any(|l| l == "debug") {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let mut targets = if config.log_context.is_empty() {
        Targets::new().with_default(level)
    } else {
        let mut targets = Targets::new().with_default(LevelFilter::OFF);
        for context in &config.log_context {
            targets = targets.with_target(context.clone(), level);
        }
        targets
    };
    for context in &config.log_exclude_context {
        targets = targets.with_target(context.clone(), LevelFilter::OFF);
    }
    targets
}

/// Initialize tracing: NDJSON to a stamped log file and to stdout.
pub fn init_logging(
    log_dir: &Path,
    config: &CrawlConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;
    let file_name = format!("crawl-{}.log", Utc::now().format("%Y%m%d%H%M%S"));
    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = build_filter(config);
    tracing_subscriber::registry()
        .with(NdjsonLayer::new(file_writer).with_filter(filter.clone()))
        .with(NdjsonLayer::new(stdout_writer).with_filter(filter))
        .init();

    // Writer guards must outlive the process; leak them like any other
    // process-lifetime resource.
    Box::leak(Box::new(file_guard));
    Box::leak(Box::new(stdout_guard));

    tracing::info!(target: "general", "logging initialized in {}", log_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_defaults_to_info() {
        let targets = build_filter(&CrawlConfig::default());
        assert!(targets.would_enable("worker", &Level::INFO));
        assert!(!targets.would_enable("worker", &Level::DEBUG));
    }

    #[test]
    fn test_debug_logging_flag() {
        let config = CrawlConfig {
            logging: vec!["debug".to_string()],
            ..Default::default()
        };
        let targets = build_filter(&config);
        assert!(targets.would_enable("state", &Level::DEBUG));
    }

    #[test]
    fn test_log_context_allows_only_listed() {
        let config = CrawlConfig {
            log_context: vec!["sitemap".to_string()],
            ..Default::default()
        };
        let targets = build_filter(&config);
        assert!(targets.would_enable("sitemap", &Level::INFO));
        assert!(!targets.would_enable("worker", &Level::INFO));
    }

    #[test]
    fn test_log_exclude_context() {
        let config = CrawlConfig {
            log_exclude_context: vec!["behavior".to_string()],
            ..Default::default()
        };
        let targets = build_filter(&config);
        assert!(targets.would_enable("worker", &Level::INFO));
        assert!(!targets.would_enable("behavior", &Level::ERROR));
    }

    #[test]
    fn test_ndjson_record_shape() {
        use std::sync::Arc;

        #[derive(Clone, Default)]
        struct SharedBuf(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buf = SharedBuf::default();
        let subscriber =
            tracing_subscriber::registry().with(NdjsonLayer::new(buf.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "pageStatus", url = "https://s/", "page loaded");
        });

        let bytes = buf.0.lock().clone();
        let record: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record["logLevel"], "info");
        assert_eq!(record["context"], "pageStatus");
        assert_eq!(record["message"], "page loaded");
        assert_eq!(record["details"]["url"], "https://s/");
        assert!(record["timestamp"].as_str().unwrap().contains('T'));
    }
}
