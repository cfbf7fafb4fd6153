//! Shelter: structured exception handling for Rust hosts
//!
//! This crate emulates structured exception handling — protected blocks with
//! handler and cleanup clauses, a rooted hierarchy of exception classes, and
//! translation of fatal OS signals into catchable events — for host programs
//! whose control flow has no such construct of its own:
//! - **Protected blocks**: guarded body, handler clauses matched by class
//!   ancestry, a cleanup clause that runs on every path out (`block` module)
//! - **Class hierarchy**: `Throwable`-rooted tree with O(depth) matching
//!   (`hierarchy` module)
//! - **Per-thread contexts**: isolated frame stacks behind a thread registry
//!   (`context` / `registry` modules)
//! - **Signal bridge**: SIGSEGV and friends surface as `RuntimeError`
//!   subclasses while a block is active (`signal` module)
//! - **Handler-clause audit**: duplicate and superfluous clauses flagged
//!   once per call site (`ledger` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use shelter_engine::{builtin, EngineOptions, Runtime};
//!
//! let rt = Runtime::new();
//! let parse_error = rt.register_class("ParseError", builtin::EXCEPTION)?;
//!
//! let exit = rt.protect()
//!     .on(parse_error, |ex| {
//!         eprintln!("recovered from {} at {}:{}", ex.name(), ex.file(), ex.line());
//!         0
//!     })
//!     .finally(|| { /* release whatever the body acquired */ })
//!     .run(|| {
//!         rt.raise(parse_error, None);
//!         unreachable!()
//!     });
//! assert_eq!(exit.value(), Some(0));
//!
//! // On thread exit, for threads that used protected blocks:
//! rt.thread_cleanup(std::thread::current().id());
//! ```
//!
//! Raising unwinds the stack (a panic carrying a private token), so every
//! intervening host frame is dropped the same way a `?` chain drops them —
//! do not catch the engine's unwind with `catch_unwind` between a raise and
//! its block.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod block;
mod context;
mod hierarchy;
mod ledger;
mod options;
mod registry;
mod runtime;
mod signal;

pub use block::{BlockExit, Protected, Raised};
pub use context::{FrameState, Scope};
pub use hierarchy::{builtin, ClassId, ClassRegistry, ExceptionClass};
pub use options::{CollectingSink, DiagnosticSink, EngineOptions, SignalMode, StderrSink};
pub use runtime::Runtime;

/// Errors from runtime configuration and class registration
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Class handle that this runtime never issued
    #[error("Unknown class id: {0}")]
    UnknownClass(usize),

    /// Class name registered twice
    #[error("Class already registered: {0}")]
    DuplicateClass(String),
}

/// Result alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Assert a condition, reporting through the runtime when it does not hold.
///
/// Inside any protected scope a violated assertion raises
/// [`builtin::FAILED_ASSERTION`] with the stringified condition as payload;
/// outside, it reports to the diagnostic sink and aborts the process iff the
/// runtime was configured with `abort_on_assert`.
#[macro_export]
macro_rules! shelter_assert {
    ($rt:expr, $cond:expr) => {
        if !($cond) {
            $rt.fail_assertion(stringify!($cond));
        }
    };
}

/// Guard-clause helper: raise `$class` when `$cond` does not hold.
#[macro_export]
macro_rules! shelter_check {
    ($rt:expr, $cond:expr, $class:expr) => {
        if !($cond) {
            $rt.raise($class, None);
        }
    };
}
