//! Structured event emission.
//!
//! The [`LogBus`] carries `(level, message)` events from the engine to
//! user-installed sinks. Sinks are registered at construction and never
//! change afterwards, so emission is a plain slice walk: no locking, no
//! allocation, safe to call from the realtime thread as long as the
//! installed sinks are themselves non-blocking.
//!
//! With the `tracing` cargo feature enabled, every emitted event is also
//! forwarded to [`tracing`] at the matching level, which is how the engine
//! plugs into a host application's existing subscriber.
//!
//! # Sink Contract
//!
//! Sinks run synchronously on whichever thread emitted the event. A sink
//! that blocks, allocates, or takes a contended lock must therefore only be
//! installed when the emitter is known not to be the audio thread; the
//! engine itself only emits preformatted string literals from the audio
//! path.

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, sync::Arc, vec::Vec};
#[cfg(feature = "std")]
use std::sync::Arc;

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Lifecycle and negotiation outcomes.
    Info,
    /// Recoverable anomalies (xruns, retries).
    Warning,
    /// Failures surfaced to the caller.
    Error,
}

impl LogLevel {
    /// Short stable name, as it appears in sink output.
    pub fn name(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// A user-installed log sink.
pub type LogSink = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Broadcast bus for engine log events.
///
/// Cloning a `LogBus` is cheap (a reference-count bump); all clones share
/// the same sink registry. A bus with no sinks discards events, which with
/// the `tracing` feature still forwards them to the subscriber.
#[derive(Clone)]
pub struct LogBus {
    sinks: Arc<[LogSink]>,
}

impl LogBus {
    /// Creates a bus with the given sinks.
    pub fn new(sinks: Vec<LogSink>) -> Self {
        Self {
            sinks: sinks.into(),
        }
    }

    /// Creates a bus that discards events (aside from `tracing` forwarding).
    pub fn disabled() -> Self {
        Self {
            sinks: Vec::new().into(),
        }
    }

    /// Emits an event to every sink, synchronously, on the calling thread.
    pub fn log(&self, level: LogLevel, message: &str) {
        #[cfg(feature = "tracing")]
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warning => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
        for sink in self.sinks.iter() {
            sink(level, message);
        }
    }

    /// Emits at [`LogLevel::Debug`].
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Emits at [`LogLevel::Info`].
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// Emits at [`LogLevel::Warning`].
    pub fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message);
    }

    /// Emits at [`LogLevel::Error`].
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Number of installed sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl Default for LogBus {
    fn default() -> Self {
        Self::disabled()
    }
}

impl core::fmt::Debug for LogBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LogBus")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn events_reach_all_sinks() {
        let seen: Arc<Mutex<Vec<(LogLevel, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&seen);
        let b = Arc::clone(&seen);

        let bus = LogBus::new(vec![
            Box::new(move |level, msg| a.lock().unwrap().push((level, msg.to_string()))),
            Box::new(move |level, msg| b.lock().unwrap().push((level, msg.to_string()))),
        ]);

        bus.warning("capture overrun");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(
            seen.iter()
                .all(|(l, m)| *l == LogLevel::Warning && m == "capture overrun")
        );
    }

    #[test]
    fn disabled_bus_is_silent() {
        let bus = LogBus::disabled();
        assert_eq!(bus.sink_count(), 0);
        bus.error("nobody is listening");
    }

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }
}
