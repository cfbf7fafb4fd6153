//! The runtime handle: class registration, raising, context lifecycle
//!
//! A `Runtime` is a cheaply cloneable handle over shared state. It owns the
//! class registry, the thread registry and the audit latch; there is no
//! hidden global default context. The only process-global pieces live in the
//! signal bridge (OS dispositions are process-global) and the one-time panic
//! hook that keeps engine raises out of the default panic banner.

use crate::context::{Context, ExceptionRecord, Frame, Scope};
use crate::hierarchy::{builtin, ClassId, ClassRegistry};
use crate::ledger::SiteLatch;
use crate::options::{DiagnosticSink, EngineOptions, StderrSink};
use crate::registry::ContextRegistry;
use crate::signal;
use crate::EngineResult;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::panic::{self, Location};
use std::sync::{Arc, Once};
use std::thread::{self, ThreadId};

/// Panic payload used for every engine unwind. Zero-sized: the actual
/// exception record travels in the raising context's current frame.
pub(crate) struct RaiseToken;

/// Filter engine raises out of the default panic banner, exactly once per
/// process. Foreign panics still reach whatever hook was installed before.
fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let prev = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().is::<RaiseToken>() {
                return;
            }
            prev(info);
        }));
    });
}

/// State shared by all clones of one runtime.
pub(crate) struct Shared {
    pub(crate) classes: RwLock<ClassRegistry>,
    pub(crate) registry: ContextRegistry,
    pub(crate) options: EngineOptions,
    pub(crate) latch: SiteLatch,
    pub(crate) sink: Box<dyn DiagnosticSink>,
}

/// Handle to the exception-handling runtime.
///
/// Create one per process (or per isolated component), clone it freely, and
/// open protected blocks with [`Runtime::protect`]. Each thread that enters
/// a block gets its own context; contexts never interact.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) shared: Arc<Shared>,
}

impl Runtime {
    /// Runtime with default options and diagnostics on standard error.
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    /// Runtime with explicit options.
    pub fn with_options(options: EngineOptions) -> Self {
        Self::with_sink(options, Box::new(StderrSink))
    }

    /// Runtime with explicit options and diagnostic sink.
    pub fn with_sink(options: EngineOptions, sink: Box<dyn DiagnosticSink>) -> Self {
        install_panic_hook();
        Runtime {
            shared: Arc::new(Shared {
                classes: RwLock::new(ClassRegistry::new()),
                registry: ContextRegistry::new(),
                options,
                latch: SiteLatch::new(),
                sink,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Runtime { shared }
    }

    // ---- class hierarchy ------------------------------------------------

    /// Register a new exception class under an existing parent.
    pub fn register_class(&self, name: &str, parent: ClassId) -> EngineResult<ClassId> {
        self.shared.classes.write().register(name, parent)
    }

    /// Look up a class handle by name.
    pub fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.shared.classes.read().get_by_name(name)
    }

    /// True iff `class` is `base` or derives from it.
    pub fn is_derived(&self, class: ClassId, base: ClassId) -> bool {
        self.shared.classes.read().is_derived(class, base)
    }

    /// Name of a class.
    pub fn class_name(&self, class: ClassId) -> String {
        self.shared.classes.read().name_of(class).to_string()
    }

    /// Originating signal number for `class` or its nearest ancestor.
    pub fn signal_of(&self, class: ClassId) -> Option<i32> {
        self.shared.classes.read().signal_of(class)
    }

    // ---- raising --------------------------------------------------------

    /// Raise an exception at the caller's source location.
    ///
    /// With a protected block active on this thread this does not return:
    /// control transfers to the block's handler selection (raise in the
    /// guarded body) or its cleanup clause (raise in a handler or cleanup).
    /// With no block active the exception is reported lost to the diagnostic
    /// sink and the call returns normally, leaving no state behind.
    #[track_caller]
    pub fn raise(&self, class: ClassId, payload: Option<Box<dyn Any + Send>>) {
        let loc = Location::caller();
        self.raise_at(class, payload, loc.file(), loc.line());
    }

    /// Raise with an explicit source location.
    pub fn raise_at(
        &self,
        class: ClassId,
        payload: Option<Box<dyn Any + Send>>,
        file: &'static str,
        line: u32,
    ) {
        let ctx = self
            .shared
            .registry
            .existing(thread::current().id())
            .filter(|c| c.depth() > 0);
        let Some(ctx) = ctx else {
            self.shared.sink.report(&format!(
                "shelter: lost exception `{}` raised at {}:{}",
                self.class_name(class),
                file,
                line
            ));
            return;
        };

        let norethrow = self
            .shared
            .classes
            .read()
            .get(class)
            .map(|c| c.norethrow)
            .unwrap_or(true);
        ctx.set_description(format!(
            "exception `{}` raised at {}:{}",
            self.class_name(class),
            file,
            line
        ));
        ctx.arm(class, payload, file, line, norethrow);
        panic::panic_any(RaiseToken);
    }

    /// Entry point for the signal bridge: raise the class mapped to a
    /// trapped signal, with no payload.
    pub(crate) fn raise_signal(&self, signum: i32) {
        if let Some(class) = signal::class_for(signum) {
            self.raise_at(class, None, file!(), line!());
        }
    }

    /// Return early from the function enclosing the current protected
    /// blocks.
    ///
    /// Every enclosing cleanup clause runs, innermost first; the context's
    /// first frame then yields [`BlockExit::Return`] with the boxed value so
    /// the original call actually returns. Outside any protected block this
    /// is a no-op — the caller just returns normally.
    ///
    /// [`BlockExit::Return`]: crate::BlockExit::Return
    #[track_caller]
    pub fn early_return<V: Any + Send>(&self, value: V) {
        if self.scope() == Scope::Outside {
            return;
        }
        let loc = Location::caller();
        self.raise_at(
            builtin::FN_RETURN,
            Some(Box::new(value)),
            loc.file(),
            loc.line(),
        );
    }

    /// Report a violated assertion.
    ///
    /// Inside any protected scope this raises `FailedAssertion` with the
    /// stringified expression as payload. Outside, it reports through the
    /// sink and aborts the process iff `abort_on_assert` is set.
    #[track_caller]
    pub fn fail_assertion(&self, expr: &str) {
        let loc = Location::caller();
        if self.scope() != Scope::Outside {
            self.raise_at(
                builtin::FAILED_ASSERTION,
                Some(Box::new(expr.to_string())),
                loc.file(),
                loc.line(),
            );
            return;
        }
        self.report_assertion(expr, loc.file(), loc.line());
        if self.shared.options.abort_on_assert {
            std::process::abort();
        }
    }

    // ---- introspection --------------------------------------------------

    /// Which part of a protected block the calling thread is executing.
    pub fn scope(&self) -> Scope {
        self.shared
            .registry
            .existing(thread::current().id())
            .map(|c| c.scope())
            .unwrap_or(Scope::Outside)
    }

    /// True iff the calling thread has an in-flight, unhandled exception.
    pub fn is_pending(&self) -> bool {
        self.shared
            .registry
            .existing(thread::current().id())
            .map(|c| c.is_pending())
            .unwrap_or(false)
    }

    /// Last formatted diagnostic for the calling thread's context, if the
    /// context is still alive (it lives from first block entry to outermost
    /// block exit or `thread_cleanup`).
    pub fn last_description(&self) -> Option<String> {
        self.shared
            .registry
            .existing(thread::current().id())
            .map(|c| c.description())
    }

    // ---- context lifecycle ----------------------------------------------

    /// Release the context registered for `tid`.
    ///
    /// Required on thread exit for threads that used protected blocks and
    /// may have died mid-block. Idempotent: a second call, or a call for a
    /// thread that never had a context, does nothing.
    pub fn thread_cleanup(&self, tid: ThreadId) {
        let removed = {
            let _guard = self.shared.registry.guard();
            self.shared.registry.remove(tid)
        };
        if let Some(ctx) = removed {
            // A context sitting in the registry with live frames belonged to
            // a thread that died mid-block: its handler installation is
            // still outstanding.
            if ctx.depth() > 0 {
                signal::restore(&self.shared, &ctx);
            }
        }
    }

    /// Push a frame for a block opening at `site`; the registry guard spans
    /// the push and any bridge installation.
    pub(crate) fn enter_block(&self, site: &'static Location<'static>) -> Arc<Context> {
        let tid = thread::current().id();
        let _guard = self.shared.registry.guard();
        let ctx = self.shared.registry.get_or_create(tid);
        if ctx.push_frame(site) {
            signal::install(&self.shared, &ctx);
        }
        ctx
    }

    /// Pop the current frame once cleanup has completed. On the outermost
    /// frame, restores signal handlers and drops the context from the
    /// registry. Returns the popped frame and whether the stack emptied.
    pub(crate) fn exit_frame(&self, ctx: &Arc<Context>) -> (Frame, bool) {
        let tid = thread::current().id();
        let _guard = self.shared.registry.guard();
        let frame = ctx.pop_frame();
        let now_empty = ctx.depth() == 0;
        debug_assert_eq!(frame.first, now_empty);
        if now_empty {
            signal::restore(&self.shared, ctx);
            self.shared.registry.remove(tid);
        }
        (frame, now_empty)
    }

    /// First handler clause whose class is an ancestor of the pending
    /// exception wins; the internal early-return event never matches.
    pub(crate) fn try_match(&self, ctx: &Context, class: ClassId) -> bool {
        let Some(active) = ctx.pending_class() else {
            return false;
        };
        if active == builtin::FN_RETURN {
            return false;
        }
        if self.shared.classes.read().is_derived(active, class) {
            ctx.mark_caught();
            true
        } else {
            false
        }
    }

    // ---- diagnostics ----------------------------------------------------

    pub(crate) fn report_lost(
        &self,
        rec: &ExceptionRecord,
        block: Option<&'static Location<'static>>,
    ) {
        let name = self.class_name(rec.class);
        let msg = match block {
            Some(site) => format!(
                "shelter: uncaught exception `{}` raised at {}:{}, lost leaving block at {}:{}",
                name,
                rec.file,
                rec.line,
                site.file(),
                site.line()
            ),
            None => format!(
                "shelter: lost exception `{}` raised at {}:{}",
                name, rec.file, rec.line
            ),
        };
        self.shared.sink.report(&msg);
    }

    fn report_assertion(&self, expr: &str, file: &str, line: u32) {
        let tag = if self.shared.options.abort_on_assert {
            ""
        } else {
            " (no abort)"
        };
        self.shared.sink.report(&format!(
            "shelter: assertion failure{}: {}, file \"{}\", line {}",
            tag, expr, file, line
        ));
    }

    /// An uncaught `FailedAssertion` reached the outermost frame.
    pub(crate) fn report_uncaught_assertion(&self, rec: &ExceptionRecord) {
        let expr = rec
            .payload
            .as_ref()
            .and_then(|p| p.downcast_ref::<String>())
            .map(String::as_str)
            .unwrap_or("<assertion>");
        self.report_assertion(expr, rec.file, rec.line);
        if self.shared.options.abort_on_assert {
            std::process::abort();
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CollectingSink;

    fn quiet_runtime() -> (Runtime, CollectingSink) {
        let sink = CollectingSink::new();
        let rt = Runtime::with_sink(
            EngineOptions {
                trap_signals: false,
                ..Default::default()
            },
            Box::new(sink.clone()),
        );
        (rt, sink)
    }

    #[test]
    fn test_raise_without_frame_is_lost() {
        let (rt, sink) = quiet_runtime();
        rt.raise(builtin::OUT_OF_MEMORY, None);
        assert_eq!(sink.count_containing("lost exception `OutOfMemory`"), 1);
        assert!(!rt.is_pending());
        assert_eq!(rt.scope(), Scope::Outside);
        // No context was created as a side effect
        assert!(rt.last_description().is_none());
    }

    #[test]
    fn test_register_and_query_through_runtime() {
        let (rt, _sink) = quiet_runtime();
        let io = rt.register_class("IoError", builtin::EXCEPTION).unwrap();
        assert_eq!(rt.class_by_name("IoError"), Some(io));
        assert!(rt.is_derived(io, builtin::THROWABLE));
        assert_eq!(rt.class_name(io), "IoError");
        assert_eq!(rt.signal_of(io), None);
    }

    #[test]
    fn test_fail_assertion_outside_scope_reports() {
        let (rt, sink) = quiet_runtime();
        rt.fail_assertion("x > 0");
        assert_eq!(sink.count_containing("assertion failure (no abort)"), 1);
        assert_eq!(sink.count_containing("x > 0"), 1);
    }

    #[test]
    fn test_thread_cleanup_without_context_is_noop() {
        let (rt, _sink) = quiet_runtime();
        let tid = thread::current().id();
        rt.thread_cleanup(tid);
        rt.thread_cleanup(tid);
    }

    #[test]
    fn test_early_return_outside_block_is_noop() {
        let (rt, sink) = quiet_runtime();
        rt.early_return(42i32);
        assert!(sink.lines().is_empty());
    }
}
