//! Runtime configuration and the diagnostic sink

use std::fmt;
use std::sync::{Arc, Mutex};

/// How the signal bridge shares OS handler slots between threads.
///
/// Signal dispositions are process-global, so the two modes differ in who
/// saves and restores them, not in who receives a trapped signal:
///
/// - `Shared`: handlers are installed when the first context in the process
///   opens its first protected block and restored when the last one closes.
///   Save/restore is reference-counted under the registry lock.
/// - `Private`: every context saves the prior dispositions itself on its own
///   empty-to-nonempty transition and restores them on the way back.
///
/// Mixing modes across runtimes in one process is the host's responsibility;
/// the mode is fixed per runtime at construction and never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalMode {
    /// Process-wide handler slots, reference-counted (default)
    Shared,
    /// Each context saves and restores handler slots independently
    Private,
}

/// Runtime construction options
///
/// Use struct update syntax for one-off overrides:
///
/// ```rust,ignore
/// let rt = Runtime::with_options(EngineOptions {
///     trap_signals: false,
///     ..Default::default()
/// });
/// ```
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Shared or private signal-handler save/restore (see [`SignalMode`])
    pub signal_mode: SignalMode,

    /// Whether the signal bridge installs handlers at all.
    ///
    /// With `false` the bridge never touches process dispositions and fatal
    /// signals keep their default behavior even inside protected blocks.
    pub trap_signals: bool,

    /// Abort the process when an assertion fails outside any protected scope
    /// or reaches the outermost frame uncaught.
    pub abort_on_assert: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            signal_mode: SignalMode::Shared,
            trap_signals: true,
            abort_on_assert: false,
        }
    }
}

/// Destination for engine diagnostics.
///
/// Everything the engine reports outside normal control flow goes through
/// one of these: lost and uncaught exceptions, handler-clause audit findings,
/// assertion failures. Hosts plug in their own sink to route diagnostics into
/// their logging; tests use a collecting sink to assert on them.
pub trait DiagnosticSink: Send + Sync {
    /// Deliver one formatted diagnostic line.
    fn report(&self, message: &str);
}

impl fmt::Debug for dyn DiagnosticSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DiagnosticSink")
    }
}

/// Default sink: one line per diagnostic on standard error.
#[derive(Debug, Default)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn report(&self, message: &str) {
        eprintln!("{}", message);
    }
}

/// Sink that stores every diagnostic line, for inspection by tests.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl CollectingSink {
    /// Create an empty collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    /// Number of lines whose text contains `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.contains(needle))
            .count()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, message: &str) {
        self.lines.lock().unwrap().push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = EngineOptions::default();
        assert_eq!(opts.signal_mode, SignalMode::Shared);
        assert!(opts.trap_signals);
        assert!(!opts.abort_on_assert);
    }

    #[test]
    fn test_collecting_sink_records_lines() {
        let sink = CollectingSink::new();
        sink.report("first");
        sink.report("second first");
        assert_eq!(sink.lines().len(), 2);
        assert_eq!(sink.count_containing("first"), 2);
        assert_eq!(sink.count_containing("second"), 1);
    }
}
