//! Structured logging to a JSON-lines file.
//!
//! stdout carries command output (including `--json` documents), so logs
//! never go there: they go to a daily-rolling file, or to stderr when no
//! file location is writable.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use camino::Utf8PathBuf;
use librarian_core::pipeline::rfc3339_now;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

const ENV_LOG_PATH: &str = "LIBRARIAN_LOG_PATH";
const ENV_LOG_DIR: &str = "LIBRARIAN_LOG_DIR";
const SYSTEM_LOG_DIR: &str = "/var/log";

/// Where logs should go, before resolution against the environment.
#[derive(Clone, Debug)]
pub struct LogSettings {
    /// Base name of the log file.
    pub service: &'static str,
    /// `log_dir` from configuration.
    pub log_dir: Option<Utf8PathBuf>,
}

impl LogSettings {
    /// Settings for this binary with the configured directory, if any.
    pub const fn new(log_dir: Option<Utf8PathBuf>) -> Self {
        Self {
            service: env!("CARGO_PKG_NAME"),
            log_dir,
        }
    }

    fn file_name(&self) -> String {
        format!("{}.jsonl", self.service)
    }
}

/// Keeps the background writer alive; drop it last.
pub struct ObservabilityGuard {
    _writer: WorkerGuard,
}

/// Install the global subscriber.
///
/// Falls back to stderr when no log file can be opened.
pub fn init_observability(settings: &LogSettings, filter: EnvFilter) -> Result<ObservabilityGuard> {
    let (writer, guard) = match LogTarget::resolve(settings).map(LogTarget::open) {
        Ok(pair) => pair,
        Err(reason) => {
            eprintln!("Warning: {reason}. Logging to stderr.");
            tracing_appender::non_blocking(std::io::stderr())
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(JsonLines { writer })
        .try_init()?;
    tracing::debug!("logging initialized");

    Ok(ObservabilityGuard { _writer: guard })
}

/// Filter from flags and environment.
///
/// `--quiet` beats `-v`, which beats `RUST_LOG`, which beats `default_level`.
pub fn env_filter(quiet: bool, verbose: u8, default_level: &str) -> EnvFilter {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 1) => "debug",
        (false, v) if v >= 2 => "trace",
        _ => {
            return EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level));
        }
    };
    EnvFilter::new(level)
}

// ──────────────────────────────────────────────
// Target resolution
// ──────────────────────────────────────────────

/// A writable log file location.
#[derive(Clone, Debug, PartialEq, Eq)]
struct LogTarget {
    dir: PathBuf,
    file_name: String,
}

impl LogTarget {
    fn resolve(settings: &LogSettings) -> Result<Self, String> {
        Self::resolve_from(
            settings,
            std::env::var_os(ENV_LOG_PATH).map(PathBuf::from),
            std::env::var_os(ENV_LOG_DIR).map(PathBuf::from),
        )
    }

    /// Explicit locations (env path, env dir, config dir) are used or fail;
    /// defaults are tried in order until one is writable.
    fn resolve_from(
        settings: &LogSettings,
        env_path: Option<PathBuf>,
        env_dir: Option<PathBuf>,
    ) -> Result<Self, String> {
        if let Some(path) = env_path {
            return Self::at_path(&path);
        }
        let explicit_dir = env_dir.or_else(|| settings.log_dir.clone().map(PathBuf::from));
        if let Some(dir) = explicit_dir {
            return Self::in_dir(dir, settings.file_name());
        }

        let mut defaults = Vec::new();
        if cfg!(unix) {
            defaults.push(PathBuf::from(SYSTEM_LOG_DIR));
        }
        if let Some(dirs) = directories::ProjectDirs::from("", "", settings.service) {
            defaults.push(dirs.data_local_dir().join("logs"));
        }
        if let Ok(cwd) = std::env::current_dir() {
            defaults.push(cwd);
        }
        defaults
            .into_iter()
            .find_map(|dir| Self::in_dir(dir, settings.file_name()).ok())
            .ok_or_else(|| "no writable log directory".to_string())
    }

    fn at_path(path: &Path) -> Result<Self, String> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| format!("{ENV_LOG_PATH} must end in a UTF-8 file name"))?;
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        Self::in_dir(dir.to_path_buf(), file_name.to_string())
    }

    fn in_dir(dir: PathBuf, file_name: String) -> Result<Self, String> {
        let target = Self { dir, file_name };
        target.check_writable()?;
        Ok(target)
    }

    /// Create the directory and make sure the file opens for append.
    fn check_writable(&self) -> Result<(), String> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| format!("cannot create log directory {}: {e}", self.dir.display()))?;
        let path = self.dir.join(&self.file_name);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map(drop)
            .map_err(|e| format!("cannot open log file {}: {e}", path.display()))
    }

    fn open(self) -> (NonBlocking, WorkerGuard) {
        let appender = tracing_appender::rolling::daily(&self.dir, &self.file_name);
        tracing_appender::non_blocking(appender)
    }
}

// ──────────────────────────────────────────────
// JSON-lines layer
// ──────────────────────────────────────────────

/// One JSON object per event: timestamp, level, target, span fields from
/// root to leaf, then the event's own fields.
struct JsonLines<W> {
    writer: W,
}

/// Recorded field values.
#[derive(Clone, Debug, Default)]
struct Fields(Map<String, Value>);

impl Fields {
    fn put(&mut self, field: &Field, value: Value) {
        self.0.insert(field.name().to_string(), value);
    }
}

impl Visit for Fields {
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(number) = serde_json::Number::from_f64(value) {
            self.put(field, Value::Number(number));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }
}

impl<S, W> tracing_subscriber::Layer<S> for JsonLines<W>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    fn on_new_span(&self, attrs: &tracing::span::Attributes<'_>, id: &tracing::span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = Fields::default();
        attrs.record(&mut fields);
        span.extensions_mut().insert(fields);
    }

    fn on_record(&self, id: &tracing::span::Id, values: &tracing::span::Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<Fields>() {
            Some(fields) => values.record(fields),
            None => {
                let mut fields = Fields::default();
                values.record(&mut fields);
                extensions.insert(fields);
            }
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut record = Map::new();
        record.insert("timestamp".into(), Value::String(rfc3339_now()));
        record.insert("level".into(), Value::String(meta.level().as_str().to_lowercase()));
        record.insert("target".into(), Value::String(meta.target().to_string()));

        for span in ctx.event_scope(event).into_iter().flat_map(|scope| scope.from_root()) {
            if let Some(fields) = span.extensions().get::<Fields>() {
                record.extend(fields.0.clone());
            }
        }

        let mut fields = Fields::default();
        event.record(&mut fields);
        record.extend(fields.0);

        let mut line = match serde_json::to_vec(&Value::Object(record)) {
            Ok(line) => line,
            Err(_) => return,
        };
        line.push(b'\n');
        let _ = self.writer.make_writer().write_all(&line);
    }
}
