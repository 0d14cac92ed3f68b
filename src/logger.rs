//! # Diagnostic logging seam
//!
//! The core never writes to process-wide mutable state: every component
//! that reports progress or skip diagnostics receives a [`Logger`]
//! object at construction and calls through it. The binary picks the
//! sink – [`TracingLogger`] forwards to whatever `tracing` subscriber
//! the binary has configured, [`NullLogger`] (the default) discards
//! everything, and callers are free to supply their own implementation
//! (a file, a test collector).

use std::fmt;
use std::sync::Arc;

/// Severity of one diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
        };
        f.write_str(s)
    }
}

/// Sink for the core's diagnostic messages.
///
/// Implementations are supplied at construction time (see
/// [`SbsInverter::with_logger`](crate::gauss_newton::SbsInverter::with_logger)
/// and [`RjSampler::with_logger`](crate::rjmcmc::sampler::RjSampler::with_logger));
/// the inverters only ever call through the object they were given.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }
}

/// Discards every message; the default when no logger is supplied.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Forwards messages to the `tracing` macros, for binaries that run a
/// `tracing` subscriber. Whether a global subscriber exists is the
/// binary's concern; the core only holds this object.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
        }
    }
}

/// The default logger object.
pub fn null_logger() -> Arc<dyn Logger> {
    Arc::new(NullLogger)
}
