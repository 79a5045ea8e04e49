//! Logging infrastructure - structured tracing for the IPC core
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels (environment or explicit config)
//! - Zero-cost when disabled
//! - Optional span events for dispatch tracing
//! - Console or file output

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

// Re-export tracing macros for use throughout the crate
pub use tracing::{debug, error, info, trace, warn};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Log file path (console output when unset)
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

        // BINDERY_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("BINDERY_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        // BINDERY_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("BINDERY_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("BINDERY_LOG_JSON").is_ok();
        config.show_spans = std::env::var("BINDERY_LOG_SPANS").is_ok();

        config
    }

    /// Verbose config for debugging dispatch problems
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: None,
            json_format: false,
            show_spans: true,
        }
    }
}

fn parse_level(value: &str) -> Level {
    match value.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config.level));

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let output = match config.log_path.as_deref() {
            Some(path) => {
                let path = Path::new(path);
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let file = path
                    .file_name()
                    .map(|name| name.to_os_string())
                    .unwrap_or_else(|| "bindery.log".into());
                let appender = tracing_appender::rolling::never(dir, file);
                fmt::layer()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_span_events(span_events)
                    .with_thread_names(true)
                    .boxed()
            }
            None if config.json_format => fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_span_events(span_events)
                .with_thread_names(true)
                .boxed(),
            None => fmt::layer()
                .with_writer(io::stderr)
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_names(true)
                .with_line_number(cfg!(debug_assertions))
                .boxed(),
        };

        // Another subscriber may already be installed by the host program.
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(output)
            .try_init();
    });
}

/// Filter used when `RUST_LOG` is unset. Every event target in the crate
/// sits under `bindery::`.
fn default_filter(level: Level) -> EnvFilter {
    EnvFilter::new(format!("bindery={}", level.as_str().to_lowercase()))
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Subsystem logging helpers
// ============================================================================

/// Log an outbound transaction
#[inline]
pub fn log_transaction_sent(handle: u32, code: u32, bytes: usize, oneway: bool) {
    trace!(
        target: "bindery::dispatch",
        handle,
        code,
        bytes,
        oneway,
        "transaction sent"
    );
}

/// Log an inbound transaction about to be dispatched
#[inline]
pub fn log_transaction_received(code: u32, sender_pid: u32, bytes: usize) {
    trace!(
        target: "bindery::dispatch",
        code,
        sender_pid,
        bytes,
        "transaction received"
    );
}

/// Log a pool size change
#[inline]
pub fn log_pool_change(event: &str, live: usize, idle: usize) {
    debug!(target: "bindery::pool", event, live, idle, "thread pool changed");
}

/// Log a proxy creation
#[inline]
pub fn log_proxy_created(handle: u32, identity: usize) {
    debug!(
        target: "bindery::registry",
        handle,
        identity = format_args!("{:#x}", identity),
        "proxy created"
    );
}
