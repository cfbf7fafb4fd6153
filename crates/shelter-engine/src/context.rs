//! Per-thread execution context and the nested frame stack

use crate::hierarchy::ClassId;
use crate::signal::SavedDispositions;
use std::any::Any;
use std::panic::Location;
use std::sync::Mutex;

/// Which part of a protected block is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// No protected block is active on this context
    Outside,
    /// The guarded body
    Try,
    /// A matched handler clause
    Catch,
    /// The cleanup clause
    Finally,
}

/// Lifecycle of a frame's active exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Nothing raised
    Empty,
    /// Raised, not yet matched by a handler clause
    Pending,
    /// Matched; a handler clause is (or has been) running
    Caught,
}

/// The active exception carried by a frame.
pub(crate) struct ExceptionRecord {
    pub class: ClassId,
    pub payload: Option<Box<dyn Any + Send>>,
    pub file: &'static str,
    pub line: u32,
}

/// Live state of one active protected block.
///
/// Pushed on block entry, popped only when the cleanup clause has fully
/// completed. The current frame is always the stack top.
pub(crate) struct Frame {
    pub scope: Scope,
    pub state: FrameState,
    pub exception: Option<ExceptionRecord>,
    /// First frame of this context (the stack was empty before the push)
    pub first: bool,
    /// Where the protected block itself opens
    pub site: &'static Location<'static>,
}

/// One logical thread's execution context.
///
/// Shared as `Arc<Context>` between the owning thread and the registry;
/// every field sits behind its own `Mutex`. Frames are only ever pushed and
/// popped by the owning thread — the registry holds the `Arc` purely so
/// `thread_cleanup` can drop it.
pub(crate) struct Context {
    /// Frame stack, innermost last
    frames: Mutex<Vec<Frame>>,

    /// Last formatted diagnostic for this context
    description: Mutex<String>,

    /// Prior signal dispositions, saved here in private signal mode
    saved: Mutex<Option<SavedDispositions>>,
}

impl Context {
    pub(crate) fn new() -> Self {
        Context {
            frames: Mutex::new(Vec::new()),
            description: Mutex::new(String::new()),
            saved: Mutex::new(None),
        }
    }

    /// Number of active frames
    pub(crate) fn depth(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Push a frame for a block opening at `site`.
    ///
    /// Returns true when the stack was empty (this is now the first frame),
    /// which is the caller's cue to install signal handlers.
    pub(crate) fn push_frame(&self, site: &'static Location<'static>) -> bool {
        let mut frames = self.frames.lock().unwrap();
        let first = frames.is_empty();
        frames.push(Frame {
            scope: Scope::Try,
            state: FrameState::Empty,
            exception: None,
            first,
            site,
        });
        first
    }

    /// Pop the current frame once its cleanup clause has completed.
    pub(crate) fn pop_frame(&self) -> Frame {
        self.frames
            .lock()
            .unwrap()
            .pop()
            .expect("pop_frame on empty frame stack")
    }

    /// Scope of the current frame, `Outside` with no frame active.
    pub(crate) fn scope(&self) -> Scope {
        self.frames
            .lock()
            .unwrap()
            .last()
            .map(|f| f.scope)
            .unwrap_or(Scope::Outside)
    }

    pub(crate) fn set_scope(&self, scope: Scope) {
        if let Some(top) = self.frames.lock().unwrap().last_mut() {
            top.scope = scope;
        }
    }

    /// True iff the current frame holds an unconsumed exception.
    pub(crate) fn is_pending(&self) -> bool {
        self.frames
            .lock()
            .unwrap()
            .last()
            .map(|f| f.state == FrameState::Pending)
            .unwrap_or(false)
    }

    /// Class of the pending exception, if any.
    pub(crate) fn pending_class(&self) -> Option<ClassId> {
        let frames = self.frames.lock().unwrap();
        let top = frames.last()?;
        if top.state != FrameState::Pending {
            return None;
        }
        top.exception.as_ref().map(|e| e.class)
    }

    /// Arm the current frame with a raised exception.
    ///
    /// A norethrow class repopulates the record; otherwise an already-present
    /// record is kept and only the state flips back to pending (re-raise of
    /// a reusable instance).
    pub(crate) fn arm(
        &self,
        class: ClassId,
        payload: Option<Box<dyn Any + Send>>,
        file: &'static str,
        line: u32,
        norethrow: bool,
    ) {
        let mut frames = self.frames.lock().unwrap();
        let top = frames.last_mut().expect("arm with no active frame");
        if norethrow || top.exception.is_none() {
            top.exception = Some(ExceptionRecord {
                class,
                payload,
                file,
                line,
            });
        }
        top.state = FrameState::Pending;
    }

    /// Consume the pending state: a handler clause matched.
    pub(crate) fn mark_caught(&self) {
        let mut frames = self.frames.lock().unwrap();
        let top = frames.last_mut().expect("mark_caught with no active frame");
        top.state = FrameState::Caught;
        top.scope = Scope::Catch;
    }

    /// Take the exception parts out of the current frame for the handler's
    /// view. The record itself stays (class, site) so the frame can still be
    /// described; only the payload moves.
    pub(crate) fn take_exception_parts(
        &self,
    ) -> (ClassId, Option<Box<dyn Any + Send>>, &'static str, u32) {
        let mut frames = self.frames.lock().unwrap();
        let top = frames.last_mut().expect("no active frame");
        let rec = top
            .exception
            .as_mut()
            .expect("caught frame without exception record");
        (rec.class, rec.payload.take(), rec.file, rec.line)
    }

    /// Transfer an exception record into this context's current frame and
    /// mark it pending: the re-raise step of nested propagation.
    pub(crate) fn adopt(&self, rec: ExceptionRecord) {
        let mut frames = self.frames.lock().unwrap();
        let top = frames.last_mut().expect("adopt with no enclosing frame");
        top.exception = Some(rec);
        top.state = FrameState::Pending;
    }

    pub(crate) fn set_description(&self, text: String) {
        *self.description.lock().unwrap() = text;
    }

    pub(crate) fn description(&self) -> String {
        self.description.lock().unwrap().clone()
    }

    /// Store prior dispositions (private signal mode).
    pub(crate) fn save_dispositions(&self, saved: SavedDispositions) {
        *self.saved.lock().unwrap() = Some(saved);
    }

    /// Take prior dispositions back out for restoration.
    pub(crate) fn take_dispositions(&self) -> Option<SavedDispositions> {
        self.saved.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::builtin;
    use std::panic::Location;

    #[track_caller]
    fn here() -> &'static Location<'static> {
        Location::caller()
    }

    #[test]
    fn test_push_pop_first_flag() {
        let ctx = Context::new();
        assert_eq!(ctx.depth(), 0);
        assert_eq!(ctx.scope(), Scope::Outside);

        assert!(ctx.push_frame(here()));
        assert!(!ctx.push_frame(here()));
        assert_eq!(ctx.depth(), 2);
        assert_eq!(ctx.scope(), Scope::Try);

        let inner = ctx.pop_frame();
        assert!(!inner.first);
        let outer = ctx.pop_frame();
        assert!(outer.first);
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn test_arm_and_match_transitions() {
        let ctx = Context::new();
        ctx.push_frame(here());
        assert!(!ctx.is_pending());

        ctx.arm(builtin::OUT_OF_MEMORY, None, "lib.rs", 12, true);
        assert!(ctx.is_pending());
        assert_eq!(ctx.pending_class(), Some(builtin::OUT_OF_MEMORY));

        ctx.mark_caught();
        assert!(!ctx.is_pending());
        assert_eq!(ctx.scope(), Scope::Catch);
        assert_eq!(ctx.pending_class(), None);
    }

    #[test]
    fn test_arm_norethrow_repopulates() {
        let ctx = Context::new();
        ctx.push_frame(here());
        ctx.arm(builtin::OUT_OF_MEMORY, None, "a.rs", 1, true);
        ctx.arm(builtin::RUNTIME_ERROR, None, "b.rs", 2, true);
        assert_eq!(ctx.pending_class(), Some(builtin::RUNTIME_ERROR));
    }
}
