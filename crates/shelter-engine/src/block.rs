//! Protected blocks: the guarded body / handler clause / cleanup grammar
//!
//! A block is built with [`Runtime::protect`], given zero or more handler
//! clauses with [`Protected::on`], an optional cleanup clause with
//! [`Protected::finally`], and executed with [`Protected::run`]:
//!
//! ```rust,ignore
//! let exit = rt.protect()
//!     .on(builtin::OUT_OF_MEMORY, |ex| { /* handle */ 0 })
//!     .finally(|| { /* always runs, exactly once */ })
//!     .run(|| { /* guarded body */ 0 });
//! ```
//!
//! The runner holds the two checkpoints of the scope state machine. A raise
//! in the guarded body unwinds to the body-entry checkpoint, where handler
//! clauses are tried in declaration order; a raise inside a handler or the
//! cleanup clause unwinds to the cleanup-entry checkpoint. The cleanup
//! clause runs exactly once on every path out, and only then is the frame
//! popped. An exception no clause matched is re-raised into the enclosing
//! block, or reported lost when the frame was the outermost.

use crate::context::{Context, FrameState, Scope};
use crate::hierarchy::{builtin, ClassId};
use crate::ledger;
use crate::runtime::{RaiseToken, Runtime};
use crate::signal;
use std::any::Any;
use std::fmt;
use std::mem;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe, Location};
use std::sync::Arc;

/// View of the caught exception handed to a matched handler clause.
pub struct Raised {
    pub(crate) class: ClassId,
    pub(crate) name: String,
    pub(crate) signum: Option<i32>,
    pub(crate) payload: Option<Box<dyn Any + Send>>,
    pub(crate) file: &'static str,
    pub(crate) line: u32,
}

impl Raised {
    /// Class of the caught exception.
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Originating signal number for signal-derived classes.
    pub fn signum(&self) -> Option<i32> {
        self.signum
    }

    /// Source file of the raise.
    pub fn file(&self) -> &'static str {
        self.file
    }

    /// Source line of the raise.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Borrow the payload, if one was attached and has type `P`.
    pub fn payload<P: Any>(&self) -> Option<&P> {
        self.payload.as_ref()?.downcast_ref::<P>()
    }

    /// Take the payload out of the exception.
    pub fn take_payload<P: Any>(&mut self) -> Option<P> {
        let payload = self.payload.take()?;
        match payload.downcast::<P>() {
            Ok(boxed) => Some(*boxed),
            Err(other) => {
                self.payload = Some(other);
                None
            }
        }
    }
}

impl fmt::Debug for Raised {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Raised")
            .field("class", &self.name)
            .field("file", &self.file)
            .field("line", &self.line)
            .finish_non_exhaustive()
    }
}

/// How a protected block finished.
pub enum BlockExit<T> {
    /// The guarded body or a matched handler produced a value
    Value(T),
    /// This was the outermost frame and the exception was not caught; it has
    /// been reported (or handed back to the OS for signal-derived classes)
    Uncaught,
    /// An early return unwound to the context's first frame; the boxed value
    /// is what the enclosing function should return
    Return(Box<dyn Any + Send>),
}

impl<T> BlockExit<T> {
    /// The completed value, if any.
    pub fn value(self) -> Option<T> {
        match self {
            BlockExit::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The early-return value, if this block ended one.
    pub fn returned<V: Any>(self) -> Option<V> {
        match self {
            BlockExit::Return(boxed) => boxed.downcast::<V>().ok().map(|b| *b),
            _ => None,
        }
    }

    /// True iff an exception escaped this (outermost) block.
    pub fn is_uncaught(&self) -> bool {
        matches!(self, BlockExit::Uncaught)
    }
}

impl<T: fmt::Debug> fmt::Debug for BlockExit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockExit::Value(v) => f.debug_tuple("Value").field(v).finish(),
            BlockExit::Uncaught => f.write_str("Uncaught"),
            BlockExit::Return(_) => f.write_str("Return(..)"),
        }
    }
}

struct Clause<'a, T> {
    class: ClassId,
    site: &'static Location<'static>,
    body: Box<dyn FnOnce(&mut Raised) -> T + 'a>,
}

/// Builder for one protected block. See the module docs for the grammar.
pub struct Protected<'a, T> {
    rt: &'a Runtime,
    site: &'static Location<'static>,
    clauses: Vec<Clause<'a, T>>,
    cleanup: Option<Box<dyn FnOnce() + 'a>>,
}

impl Runtime {
    /// Open a protected block at the caller's location.
    #[track_caller]
    pub fn protect<T>(&self) -> Protected<'_, T> {
        Protected {
            rt: self,
            site: Location::caller(),
            clauses: Vec::new(),
            cleanup: None,
        }
    }
}

impl<'a, T> Protected<'a, T> {
    /// Declare a handler clause guarding `class`.
    ///
    /// Clauses are tried in declaration order against the pending
    /// exception's class; the first whose guarded class is an ancestor (or
    /// the class itself) runs, and later clauses are not evaluated.
    #[track_caller]
    pub fn on<F>(mut self, class: ClassId, handler: F) -> Self
    where
        F: FnOnce(&mut Raised) -> T + 'a,
    {
        self.clauses.push(Clause {
            class,
            site: Location::caller(),
            body: Box::new(handler),
        });
        self
    }

    /// Declare the cleanup clause. It runs exactly once on every path out of
    /// the block: normal completion, caught or uncaught exception, early
    /// return, even a foreign panic.
    pub fn finally<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce() + 'a,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Run the guarded body under this block.
    pub fn run<F>(mut self, body: F) -> BlockExit<T>
    where
        F: FnOnce() -> T,
    {
        let rt = self.rt;
        let ctx = rt.enter_block(self.site);

        if rt.shared.latch.first_visit(self.site) {
            let declared: Vec<_> = self.clauses.iter().map(|c| (c.class, c.site)).collect();
            ledger::audit_clauses(
                &rt.shared.classes.read(),
                rt.shared.sink.as_ref(),
                self.site,
                &declared,
            );
        }

        let mut value: Option<T> = None;
        let mut foreign: Option<Box<dyn Any + Send>> = None;

        // Body-entry checkpoint: a raise inside the guarded body lands here.
        match catch_unwind(AssertUnwindSafe(body)) {
            Ok(v) => value = Some(v),
            Err(payload) => {
                if !payload.is::<RaiseToken>() {
                    foreign = Some(payload);
                }
            }
        }

        // Handler-clause selection, still in the frame's Try scope.
        if foreign.is_none() && ctx.is_pending() {
            for clause in mem::take(&mut self.clauses) {
                if rt.try_match(&ctx, clause.class) {
                    let mut raised = raised_view(rt, &ctx);
                    let handler = clause.body;
                    // Cleanup-entry checkpoint for raises inside the handler.
                    match catch_unwind(AssertUnwindSafe(|| handler(&mut raised))) {
                        Ok(v) => value = Some(v),
                        Err(payload) => {
                            if !payload.is::<RaiseToken>() {
                                foreign = Some(payload);
                            }
                        }
                    }
                    break;
                }
            }
        }

        // The cleanup clause always runs, exactly once, before the frame
        // leaves. A raise inside it replaces the active exception.
        ctx.set_scope(Scope::Finally);
        if let Some(cleanup) = self.cleanup.take() {
            match catch_unwind(AssertUnwindSafe(cleanup)) {
                Ok(()) => {}
                Err(payload) => {
                    if !payload.is::<RaiseToken>() {
                        foreign = Some(payload);
                    }
                }
            }
        }

        finish(rt, &ctx, value, foreign)
    }
}

/// Build the handler's view of the caught exception. The payload moves out
/// of the frame; class and location stay for the frame's own bookkeeping.
fn raised_view(rt: &Runtime, ctx: &Context) -> Raised {
    let (class, payload, file, line) = ctx.take_exception_parts();
    let classes = rt.shared.classes.read();
    Raised {
        class,
        name: classes.name_of(class).to_string(),
        signum: classes.signal_of(class),
        payload,
        file,
        line,
    }
}

/// Pop the frame and decide where control goes: return a value, continue the
/// unwind into the enclosing block, or — on the outermost frame — dispose of
/// whatever is still pending.
fn finish<T>(
    rt: &Runtime,
    ctx: &Arc<Context>,
    value: Option<T>,
    foreign: Option<Box<dyn Any + Send>>,
) -> BlockExit<T> {
    let (frame, now_empty) = rt.exit_frame(ctx);

    if let Some(payload) = foreign {
        // A foreign panic owns this unwind; a pending engine exception is
        // discarded with its frame, which the host should get to hear about.
        if frame.state == FrameState::Pending {
            if let Some(rec) = frame.exception.as_ref() {
                rt.report_lost(rec, Some(frame.site));
            }
        }
        resume_unwind(payload);
    }

    if frame.state != FrameState::Pending {
        let v = value.expect("completed protected block without a value");
        return BlockExit::Value(v);
    }

    let rec = frame
        .exception
        .expect("pending frame without an exception record");

    if !now_empty {
        // Nested case: the enclosing block's clauses get their chance.
        ctx.adopt(rec);
        std::panic::panic_any(RaiseToken);
    }

    // Outermost frame: the exception has nowhere left to go.
    if rec.class == builtin::FAILED_ASSERTION {
        rt.report_uncaught_assertion(&rec);
        return BlockExit::Uncaught;
    }
    if rt.shared.options.trap_signals && cfg!(unix) {
        if let Some(signum) = rt.shared.classes.read().signal_of(rec.class) {
            // Handlers were restored when the stack emptied; the genuine
            // signal now meets whatever disposition existed before us.
            signal::reraise(signum);
            return BlockExit::Uncaught;
        }
    }
    if rec.class == builtin::FN_RETURN {
        let payload = rec.payload.unwrap_or_else(|| Box::new(()));
        return BlockExit::Return(payload);
    }
    rt.report_lost(&rec, Some(frame.site));
    BlockExit::Uncaught
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{CollectingSink, EngineOptions};

    fn quiet_runtime() -> Runtime {
        Runtime::with_sink(
            EngineOptions {
                trap_signals: false,
                ..Default::default()
            },
            Box::new(CollectingSink::new()),
        )
    }

    #[test]
    fn test_plain_body_value() {
        let rt = quiet_runtime();
        let exit = rt.protect().run(|| 7);
        assert_eq!(exit.value(), Some(7));
        assert_eq!(rt.scope(), Scope::Outside);
    }

    #[test]
    fn test_handler_provides_value() {
        let rt = quiet_runtime();
        let exit = rt
            .protect()
            .on(builtin::EXCEPTION, |_ex| -1)
            .run(|| {
                rt.raise(builtin::OUT_OF_MEMORY, None);
                0
            });
        assert_eq!(exit.value(), Some(-1));
    }

    #[test]
    fn test_scope_transitions_visible() {
        let rt = quiet_runtime();
        rt.protect()
            .on(builtin::EXCEPTION, |_ex| {
                assert_eq!(rt.scope(), Scope::Catch);
            })
            .finally(|| {
                assert_eq!(rt.scope(), Scope::Finally);
            })
            .run(|| {
                assert_eq!(rt.scope(), Scope::Try);
                rt.raise(builtin::EXCEPTION, None);
            });
    }
}
