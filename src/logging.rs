//! Logging infrastructure - structured tracing for layout, calls and trampolines
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Per-concern targets (`layout`, `ffi`, `trampoline`)
//! - Zero-cost when disabled
//! - Console or file output, human-readable or JSON

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Log file path; console output when `None`
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // DYNFFI_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("DYNFFI_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        // DYNFFI_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("DYNFFI_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("DYNFFI_LOG_JSON").is_ok();
        config.show_spans = std::env::var("DYNFFI_LOG_SPANS").is_ok();

        config
    }

    /// Errors only
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Everything, including per-element layout and per-call events
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: Some("dynffi.log".to_string()),
            json_format: false,
            show_spans: true,
        }
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with default configuration
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// Only the first call installs a subscriber; later calls are no-ops, as is
/// any call made after another global subscriber was installed.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("dynffi={}", config.level.as_str().to_lowercase()))
                .add_directive(level_directive("layout", config.level))
                .add_directive(level_directive("ffi", config.level))
                .add_directive(level_directive("trampoline", config.level))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let file_appender = config.log_path.as_deref().map(|path| {
            let path = Path::new(path);
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map_or_else(|| "dynffi.log".into(), |name| name.to_os_string());
            tracing_appender::rolling::never(directory, file_name)
        });

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match (file_appender, config.json_format) {
            (Some(appender), true) => registry
                .with(fmt::layer().json().with_writer(appender).with_span_events(span_events))
                .try_init(),
            (Some(appender), false) => registry
                .with(
                    fmt::layer()
                        .with_writer(appender)
                        .with_ansi(false)
                        .with_span_events(span_events)
                        .with_target(true),
                )
                .try_init(),
            (None, true) => registry
                .with(fmt::layer().json().with_writer(io::stderr).with_span_events(span_events))
                .try_init(),
            (None, false) => registry
                .with(
                    fmt::layer()
                        .with_writer(io::stderr)
                        .with_span_events(span_events)
                        .with_target(true)
                        .with_thread_ids(cfg!(debug_assertions))
                        .with_line_number(cfg!(debug_assertions)),
                )
                .try_init(),
        };

        // Another subscriber may already own the global default.
        result.ok();
    });
}

fn level_directive(target: &str, level: Level) -> tracing_subscriber::filter::Directive {
    format!("{}={}", target, level.as_str().to_lowercase())
        .parse()
        .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::from_level(level).into())
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Interop-specific logging functions
// ============================================================================

/// Log native function call
#[inline]
pub fn log_ffi_call(fn_name: &str, arg_count: usize) {
    tracing::trace!(
        target: "ffi",
        event = "ffi_call",
        function = fn_name,
        args = arg_count,
        "native function called"
    );
}

/// Log native function return
#[inline]
pub fn log_ffi_return(fn_name: &str) {
    tracing::trace!(
        target: "ffi",
        event = "ffi_return",
        function = fn_name,
        "native function returned"
    );
}

/// Log native function error
#[inline]
pub fn log_ffi_error(fn_name: &str, error: &str) {
    tracing::warn!(
        target: "ffi",
        event = "ffi_error",
        function = fn_name,
        error = error,
        "native function reported an error"
    );
}
