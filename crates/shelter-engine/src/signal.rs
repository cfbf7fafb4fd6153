//! Bridge between fatal OS signals and catchable exception classes
//!
//! While at least one protected block is active, the five fatal signals
//! (abort, arithmetic fault, illegal instruction, memory fault, bus error)
//! are trapped and re-surface as raises of their dedicated `RuntimeError`
//! subclasses. When the last block closes the prior dispositions come back,
//! so a signal with no block active anywhere behaves exactly as if the
//! engine had never run.
//!
//! The handler unwinds (it raises): it is declared `extern "C-unwind"` and
//! never returns through `sigreturn` when a block is active, the same
//! contract POSIX places on handlers that leave via `siglongjmp`. Only
//! synchronous faults are trapped, so delivery happens on the faulting
//! thread and the raise lands in that thread's context.
//!
//! On platforms without POSIX signal delivery the whole bridge is a no-op:
//! install and restore do nothing and signal-derived classes can only be
//! raised explicitly by the host.

use crate::hierarchy::{builtin, ClassId};

// Signal numbers also feed the builtin class table on non-unix targets,
// where the classes exist but can never originate from a real signal.
#[cfg(unix)]
pub(crate) const SIG_ABORT: i32 = libc::SIGABRT;
#[cfg(unix)]
pub(crate) const SIG_FPE: i32 = libc::SIGFPE;
#[cfg(unix)]
pub(crate) const SIG_ILL: i32 = libc::SIGILL;
#[cfg(unix)]
pub(crate) const SIG_SEGV: i32 = libc::SIGSEGV;
#[cfg(unix)]
pub(crate) const SIG_BUS: i32 = libc::SIGBUS;

#[cfg(not(unix))]
pub(crate) const SIG_ABORT: i32 = 6;
#[cfg(not(unix))]
pub(crate) const SIG_FPE: i32 = 8;
#[cfg(not(unix))]
pub(crate) const SIG_ILL: i32 = 4;
#[cfg(not(unix))]
pub(crate) const SIG_SEGV: i32 = 11;
#[cfg(not(unix))]
pub(crate) const SIG_BUS: i32 = 7;

/// The trapped signals, in save/restore order.
pub(crate) const TRAPPED: [i32; 5] = [SIG_ABORT, SIG_FPE, SIG_ILL, SIG_SEGV, SIG_BUS];

/// Class a trapped signal surfaces as.
pub(crate) fn class_for(signum: i32) -> Option<ClassId> {
    match signum {
        SIG_ABORT => Some(builtin::ABNORMAL_TERMINATION),
        SIG_FPE => Some(builtin::ARITHMETIC_ERROR),
        SIG_ILL => Some(builtin::ILLEGAL_INSTRUCTION),
        SIG_SEGV => Some(builtin::SEGMENTATION),
        SIG_BUS => Some(builtin::BUS_ERROR),
        _ => None,
    }
}

#[cfg(unix)]
pub(crate) use unix::{install, reraise, restore, SavedDispositions};

#[cfg(unix)]
mod unix {
    use super::TRAPPED;
    use crate::context::Context;
    use crate::options::SignalMode;
    use crate::runtime::{Runtime, Shared};
    use once_cell::sync::Lazy;
    use parking_lot::Mutex;
    use std::mem;
    use std::sync::{Arc, Weak};

    /// Prior dispositions for the five trapped signals.
    pub(crate) struct SavedDispositions([libc::sigaction; TRAPPED.len()]);

    // sigaction is plain data (handler address, mask, flags)
    unsafe impl Send for SavedDispositions {}

    /// Shared-mode bridge state: how many contexts currently have an active
    /// protected block, and the dispositions saved at the 0 -> 1 transition.
    struct BridgeState {
        active: usize,
        saved: Option<SavedDispositions>,
    }

    static BRIDGE: Lazy<Mutex<BridgeState>> = Lazy::new(|| {
        Mutex::new(BridgeState {
            active: 0,
            saved: None,
        })
    });

    /// Where the installed handler delivers raises. A weak handle: an
    /// abandoned runtime upgrades to `None` and the handler stands down.
    static DELIVERY: Lazy<Mutex<Option<Weak<Shared>>>> = Lazy::new(|| Mutex::new(None));

    /// The trapped-signal handler. Re-installs itself first (platforms that
    /// reset the disposition on delivery), then raises the mapped class on
    /// the faulting thread's context.
    extern "C-unwind" fn trap_handler(signum: libc::c_int) {
        // SAFETY: re-installing our own handler for a signal we trapped.
        unsafe {
            replace_one(signum);
        }
        let shared = DELIVERY.lock().clone().and_then(|w| w.upgrade());
        if let Some(shared) = shared {
            Runtime::from_shared(shared).raise_signal(signum);
        }
    }

    /// Install our handler for `signum`, returning the prior action.
    ///
    /// # Safety
    /// `signum` must be one of the trapped signals.
    unsafe fn replace_one(signum: libc::c_int) -> libc::sigaction {
        // SAFETY: sa is fully initialized before the sigaction call; the
        // handler pointer stays valid for the process lifetime.
        unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = trap_handler as extern "C-unwind" fn(libc::c_int) as usize;
            libc::sigemptyset(&mut sa.sa_mask);
            // The handler leaves by unwinding, never through sigreturn, so
            // the kernel must not block the signal during delivery — a
            // blocked entry would survive the unwind and stall the next trap.
            sa.sa_flags = libc::SA_NODEFER;

            let mut old: libc::sigaction = mem::zeroed();
            libc::sigaction(signum, &sa, &mut old);
            old
        }
    }

    /// Replace all trapped dispositions, returning the priors.
    fn replace_all() -> SavedDispositions {
        // SAFETY: every element of TRAPPED is a valid trapped signal.
        let saved = TRAPPED.map(|sig| unsafe { replace_one(sig) });
        SavedDispositions(saved)
    }

    /// Put saved dispositions back.
    fn restore_all(saved: SavedDispositions) {
        for (sig, old) in TRAPPED.iter().zip(saved.0.iter()) {
            // SAFETY: old came out of sigaction for this same signal.
            unsafe {
                libc::sigaction(*sig, old, std::ptr::null_mut());
            }
        }
    }

    fn set_delivery(shared: &Arc<Shared>) {
        let mut slot = DELIVERY.lock();
        if slot.as_ref().and_then(Weak::upgrade).is_none() {
            *slot = Some(Arc::downgrade(shared));
        }
    }

    /// A context's frame stack went empty -> non-empty: trap the signals.
    ///
    /// Called with the registry guard held, which makes the shared-mode
    /// count transition atomic with the frame push.
    pub(crate) fn install(shared: &Arc<Shared>, ctx: &Arc<Context>) {
        if !shared.options.trap_signals {
            return;
        }
        set_delivery(shared);
        match shared.options.signal_mode {
            SignalMode::Shared => {
                let mut state = BRIDGE.lock();
                state.active += 1;
                if state.active == 1 {
                    state.saved = Some(replace_all());
                }
            }
            SignalMode::Private => {
                ctx.save_dispositions(replace_all());
            }
        }
    }

    /// A context's frame stack went non-empty -> empty (or the context is
    /// being cleaned up): hand the dispositions back.
    pub(crate) fn restore(shared: &Shared, ctx: &Context) {
        if !shared.options.trap_signals {
            return;
        }
        match shared.options.signal_mode {
            SignalMode::Shared => {
                let mut state = BRIDGE.lock();
                if state.active > 0 {
                    state.active -= 1;
                    if state.active == 0 {
                        if let Some(saved) = state.saved.take() {
                            restore_all(saved);
                        }
                    }
                }
            }
            SignalMode::Private => {
                if let Some(saved) = ctx.take_dispositions() {
                    restore_all(saved);
                }
            }
        }
    }

    /// Deliver the genuine signal to whatever disposition is now current.
    /// Used after restore() so an uncaught signal-derived exception meets
    /// its normal fatal fate.
    pub(crate) fn reraise(signum: i32) {
        // SAFETY: raising a signal on the current thread; the engine has
        // already restored the prior disposition.
        unsafe {
            libc::raise(signum);
        }
    }

    #[cfg(test)]
    pub(crate) fn shared_active() -> usize {
        BRIDGE.lock().active
    }
}

#[cfg(not(unix))]
pub(crate) use fallback::{install, reraise, restore, SavedDispositions};

#[cfg(not(unix))]
mod fallback {
    use crate::context::Context;
    use crate::runtime::Shared;
    use std::sync::Arc;

    /// No dispositions to save without POSIX signals.
    pub(crate) struct SavedDispositions;

    pub(crate) fn install(_shared: &Arc<Shared>, _ctx: &Arc<Context>) {}

    pub(crate) fn restore(_shared: &Shared, _ctx: &Context) {}

    pub(crate) fn reraise(_signum: i32) {}
}
