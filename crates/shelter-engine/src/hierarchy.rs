//! Exception class hierarchy: registration and ancestor matching

use crate::signal;
use crate::{EngineError, EngineResult};
use rustc_hash::FxHashMap;

/// Handle to a registered exception class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub(crate) usize);

impl ClassId {
    /// Raw index of this class in the registry.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Metadata for one registered exception class.
///
/// Immutable after registration; lives as long as the runtime.
#[derive(Debug, Clone)]
pub struct ExceptionClass {
    /// Class name, unique within the registry
    pub name: String,
    /// Parent class; `None` only for the root `Throwable`
    pub parent: Option<ClassId>,
    /// A raise of this class repopulates the frame's exception record
    /// (the instance is not reconstructable from a prior one)
    pub norethrow: bool,
    /// Originating OS signal for signal-derived classes
    pub signum: Option<i32>,
}

/// Built-in class handles, in registration order.
///
/// The tree rooted at [`THROWABLE`]:
///
/// ```text
/// Throwable
/// └── Exception
///     ├── OutOfMemory
///     ├── FailedAssertion
///     └── RuntimeError
///         ├── AbnormalTermination   (SIGABRT)
///         ├── ArithmeticError       (SIGFPE)
///         ├── IllegalInstruction    (SIGILL)
///         ├── Segmentation          (SIGSEGV)
///         └── BusError              (SIGBUS)
/// ```
///
/// User classes register anywhere under [`EXCEPTION`].
pub mod builtin {
    use super::ClassId;

    /// Universal root; every class derives from it
    pub const THROWABLE: ClassId = ClassId(0);
    /// Root for ordinary and user-declared classes
    pub const EXCEPTION: ClassId = ClassId(1);
    /// Allocation exhaustion reported by the host
    pub const OUT_OF_MEMORY: ClassId = ClassId(2);
    /// Assertion violated inside a protected scope
    pub const FAILED_ASSERTION: ClassId = ClassId(3);
    /// Root of the signal-derived classes
    pub const RUNTIME_ERROR: ClassId = ClassId(4);
    /// SIGABRT
    pub const ABNORMAL_TERMINATION: ClassId = ClassId(5);
    /// SIGFPE
    pub const ARITHMETIC_ERROR: ClassId = ClassId(6);
    /// SIGILL
    pub const ILLEGAL_INSTRUCTION: ClassId = ClassId(7);
    /// SIGSEGV
    pub const SEGMENTATION: ClassId = ClassId(8);
    /// SIGBUS
    pub const BUS_ERROR: ClassId = ClassId(9);

    /// Internal early-return event. Deliberately a direct child of
    /// [`THROWABLE`] (not [`EXCEPTION`]) and never matched by handler
    /// clauses: it must reach the context's first frame.
    pub(crate) const FN_RETURN: ClassId = ClassId(10);

    pub(crate) const COUNT: usize = 11;
}

/// Class registry: the rooted tree plus a name index.
///
/// Classes are stored by id in registration order; parent edges always point
/// at an earlier id, so ancestor chains cannot cycle.
#[derive(Debug)]
pub struct ClassRegistry {
    /// Classes indexed by ID
    classes: Vec<ExceptionClass>,
    /// Class name to ID mapping
    name_to_id: FxHashMap<String, ClassId>,
}

impl ClassRegistry {
    /// Create a registry pre-populated with the builtin tree.
    pub fn new() -> Self {
        let mut reg = ClassRegistry {
            classes: Vec::new(),
            name_to_id: FxHashMap::default(),
        };
        reg.push_builtin("Throwable", None, None);
        reg.push_builtin("Exception", Some(builtin::THROWABLE), None);
        reg.push_builtin("OutOfMemory", Some(builtin::EXCEPTION), None);
        reg.push_builtin("FailedAssertion", Some(builtin::EXCEPTION), None);
        reg.push_builtin("RuntimeError", Some(builtin::EXCEPTION), None);
        reg.push_builtin(
            "AbnormalTermination",
            Some(builtin::RUNTIME_ERROR),
            Some(signal::SIG_ABORT),
        );
        reg.push_builtin(
            "ArithmeticError",
            Some(builtin::RUNTIME_ERROR),
            Some(signal::SIG_FPE),
        );
        reg.push_builtin(
            "IllegalInstruction",
            Some(builtin::RUNTIME_ERROR),
            Some(signal::SIG_ILL),
        );
        reg.push_builtin(
            "Segmentation",
            Some(builtin::RUNTIME_ERROR),
            Some(signal::SIG_SEGV),
        );
        reg.push_builtin("BusError", Some(builtin::RUNTIME_ERROR), Some(signal::SIG_BUS));
        reg.push_builtin("FnReturn", Some(builtin::THROWABLE), None);
        debug_assert_eq!(reg.classes.len(), builtin::COUNT);
        reg
    }

    fn push_builtin(&mut self, name: &str, parent: Option<ClassId>, signum: Option<i32>) {
        let id = ClassId(self.classes.len());
        self.classes.push(ExceptionClass {
            name: name.to_string(),
            parent,
            norethrow: true,
            signum,
        });
        self.name_to_id.insert(name.to_string(), id);
    }

    /// Register a new class under an existing parent.
    ///
    /// The class is permanently added to the tree; there is no removal.
    pub fn register(&mut self, name: &str, parent: ClassId) -> EngineResult<ClassId> {
        if parent.0 >= self.classes.len() {
            return Err(EngineError::UnknownClass(parent.0));
        }
        if self.name_to_id.contains_key(name) {
            return Err(EngineError::DuplicateClass(name.to_string()));
        }
        let id = ClassId(self.classes.len());
        self.classes.push(ExceptionClass {
            name: name.to_string(),
            parent: Some(parent),
            norethrow: true,
            signum: None,
        });
        self.name_to_id.insert(name.to_string(), id);
        Ok(id)
    }

    /// Get class metadata by ID
    pub fn get(&self, id: ClassId) -> Option<&ExceptionClass> {
        self.classes.get(id.0)
    }

    /// Get a class handle by name
    pub fn get_by_name(&self, name: &str) -> Option<ClassId> {
        self.name_to_id.get(name).copied()
    }

    /// Name of a class, or `"<unknown>"` for an id this registry never issued.
    pub fn name_of(&self, id: ClassId) -> &str {
        self.classes
            .get(id.0)
            .map(|c| c.name.as_str())
            .unwrap_or("<unknown>")
    }

    /// True iff walking `class` → parent → … reaches `base`.
    ///
    /// `base == class` counts as a match. O(depth).
    pub fn is_derived(&self, class: ClassId, base: ClassId) -> bool {
        let mut cur = Some(class);
        while let Some(id) = cur {
            if id == base {
                return true;
            }
            cur = self.classes.get(id.0).and_then(|c| c.parent);
        }
        false
    }

    /// Originating signal number of `class` or its nearest ancestor
    /// carrying one.
    pub fn signal_of(&self, class: ClassId) -> Option<i32> {
        let mut cur = Some(class);
        while let Some(id) = cur {
            let meta = self.classes.get(id.0)?;
            if let Some(signum) = meta.signum {
                return Some(signum);
            }
            cur = meta.parent;
        }
        None
    }

    /// Number of registered classes
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Always false: the builtin tree is registered at construction
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Iterate over all classes with their IDs
    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &ExceptionClass)> {
        self.classes.iter().enumerate().map(|(i, c)| (ClassId(i), c))
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tree_shape() {
        let reg = ClassRegistry::new();
        assert_eq!(reg.len(), builtin::COUNT);
        assert_eq!(reg.name_of(builtin::THROWABLE), "Throwable");
        assert_eq!(reg.get(builtin::THROWABLE).unwrap().parent, None);
        assert_eq!(
            reg.get(builtin::SEGMENTATION).unwrap().parent,
            Some(builtin::RUNTIME_ERROR)
        );
        assert_eq!(reg.get_by_name("OutOfMemory"), Some(builtin::OUT_OF_MEMORY));
    }

    #[test]
    fn test_register_under_existing_parent() {
        let mut reg = ClassRegistry::new();
        let parse = reg.register("ParseError", builtin::EXCEPTION).unwrap();
        let eof = reg.register("UnexpectedEof", parse).unwrap();

        assert!(reg.is_derived(eof, parse));
        assert!(reg.is_derived(eof, builtin::EXCEPTION));
        assert!(reg.is_derived(eof, builtin::THROWABLE));
        assert!(!reg.is_derived(parse, eof));
    }

    #[test]
    fn test_register_duplicate_name_fails() {
        let mut reg = ClassRegistry::new();
        reg.register("ParseError", builtin::EXCEPTION).unwrap();
        let err = reg.register("ParseError", builtin::EXCEPTION).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateClass(_)));
    }

    #[test]
    fn test_register_unknown_parent_fails() {
        let mut reg = ClassRegistry::new();
        let bogus = ClassId(9999);
        let err = reg.register("Orphan", bogus).unwrap_err();
        assert!(matches!(err, EngineError::UnknownClass(9999)));
    }

    #[test]
    fn test_is_derived_self_and_root() {
        let reg = ClassRegistry::new();
        assert!(reg.is_derived(builtin::EXCEPTION, builtin::EXCEPTION));
        assert!(reg.is_derived(builtin::BUS_ERROR, builtin::THROWABLE));
        // Siblings do not match in either direction
        assert!(!reg.is_derived(builtin::OUT_OF_MEMORY, builtin::RUNTIME_ERROR));
        assert!(!reg.is_derived(builtin::RUNTIME_ERROR, builtin::OUT_OF_MEMORY));
    }

    #[test]
    fn test_signal_of_walks_ancestors() {
        let mut reg = ClassRegistry::new();
        assert_eq!(
            reg.signal_of(builtin::ARITHMETIC_ERROR),
            Some(signal::SIG_FPE)
        );
        assert_eq!(reg.signal_of(builtin::RUNTIME_ERROR), None);

        // A user subclass of a signal leaf inherits its signal number
        let sub = reg.register("DivByZero", builtin::ARITHMETIC_ERROR).unwrap();
        assert_eq!(reg.signal_of(sub), Some(signal::SIG_FPE));
    }
}
