//! Structured logging utilities for nsvfs components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use nsvfs_config::log_vfs_debug;
//!
//! log_vfs_debug!("Entry detached", name = "file", orphaned = true);
//! log_snapshot_info!("Image saved", path = %path.display());
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const VFS: &'static str = "VFS";
    pub const LIFECYCLE: &'static str = "LIFECYCLE";
    pub const SNAPSHOT: &'static str = "SNAPSHOT";
    pub const CLI: &'static str = "CLI";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse a level name, defaulting to `Info` for anything unknown
    pub fn parse(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === VFS logging macros ===

#[macro_export]
macro_rules! log_vfs_warn {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::warn!(component = "VFS", $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_vfs_info {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::info!(component = "VFS", $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_vfs_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = "VFS", $($($field)+,)? $msg)
    };
}

// === LIFECYCLE logging macros ===

#[macro_export]
macro_rules! log_lifecycle_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = "LIFECYCLE", $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_lifecycle_trace {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::trace!(component = "LIFECYCLE", $($($field)+,)? $msg)
    };
}

// === SNAPSHOT logging macros ===

#[macro_export]
macro_rules! log_snapshot_warn {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::warn!(component = "SNAPSHOT", $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_snapshot_info {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::info!(component = "SNAPSHOT", $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_snapshot_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = "SNAPSHOT", $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_snapshot_trace {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::trace!(component = "SNAPSHOT", $($($field)+,)? $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_info {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::info!(component = "CLI", $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_cli_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = "CLI", $($($field)+,)? $msg)
    };
}

/// Initialize logging to stderr with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
