//! One-shot handler-clause audit, latched per protected-block call site
//!
//! A runtime substitute for a compile-time check: the first time a given
//! protected block executes, its declared handler clauses are audited for
//! duplicates and for clauses already covered by an earlier ancestor clause.
//! The latch then flips and the site is never audited again, so steady-state
//! block entry pays one set lookup.

use crate::hierarchy::{ClassId, ClassRegistry};
use crate::options::DiagnosticSink;
use dashmap::DashSet;
use std::panic::Location;

/// Identity of one protected-block call site.
pub(crate) type SiteKey = (&'static str, u32, u32);

fn site_key(site: &'static Location<'static>) -> SiteKey {
    (site.file(), site.line(), site.column())
}

/// The per-runtime latch table.
pub(crate) struct SiteLatch {
    audited: DashSet<SiteKey>,
}

impl SiteLatch {
    pub(crate) fn new() -> Self {
        SiteLatch {
            audited: DashSet::new(),
        }
    }

    /// True exactly once per site, ever.
    pub(crate) fn first_visit(&self, site: &'static Location<'static>) -> bool {
        self.audited.insert(site_key(site))
    }
}

/// Audit one block's declared clauses, in declaration order.
///
/// Each clause is `(guarded class, clause location)`. Findings go to the
/// diagnostic sink; the entry list is discarded afterwards.
pub(crate) fn audit_clauses(
    classes: &ClassRegistry,
    sink: &dyn DiagnosticSink,
    site: &'static Location<'static>,
    clauses: &[(ClassId, &'static Location<'static>)],
) {
    if clauses.is_empty() {
        sink.report(&format!(
            "shelter: protected block at {}:{} declares no handler clauses",
            site.file(),
            site.line()
        ));
        return;
    }

    let mut entries: Vec<ClassId> = Vec::with_capacity(clauses.len());
    for &(class, loc) in clauses {
        if entries.iter().any(|&seen| seen == class) {
            sink.report(&format!(
                "shelter: duplicate handler clause for `{}` at {}:{} (first clause kept)",
                classes.name_of(class),
                loc.file(),
                loc.line()
            ));
        } else if let Some(&ancestor) = entries.iter().find(|&&seen| classes.is_derived(class, seen))
        {
            sink.report(&format!(
                "shelter: superfluous handler clause for `{}` at {}:{} (already caught by `{}`)",
                classes.name_of(class),
                loc.file(),
                loc.line(),
                classes.name_of(ancestor)
            ));
        } else {
            entries.push(class);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::builtin;
    use crate::options::CollectingSink;

    #[track_caller]
    fn here() -> &'static Location<'static> {
        Location::caller()
    }

    #[test]
    fn test_latch_fires_once_per_site() {
        let latch = SiteLatch::new();
        let site = here();
        assert!(latch.first_visit(site));
        assert!(!latch.first_visit(site));

        // A different site is independent
        assert!(latch.first_visit(here()));
    }

    #[test]
    fn test_duplicate_clause_reported() {
        let classes = ClassRegistry::new();
        let sink = CollectingSink::new();
        audit_clauses(
            &classes,
            &sink,
            here(),
            &[
                (builtin::OUT_OF_MEMORY, here()),
                (builtin::OUT_OF_MEMORY, here()),
            ],
        );
        assert_eq!(sink.count_containing("duplicate handler clause"), 1);
        assert_eq!(sink.count_containing("OutOfMemory"), 1);
    }

    #[test]
    fn test_ancestor_makes_descendant_superfluous() {
        let classes = ClassRegistry::new();
        let sink = CollectingSink::new();
        audit_clauses(
            &classes,
            &sink,
            here(),
            &[
                (builtin::EXCEPTION, here()),
                (builtin::SEGMENTATION, here()),
            ],
        );
        assert_eq!(sink.count_containing("superfluous handler clause"), 1);
        assert_eq!(sink.count_containing("already caught by `Exception`"), 1);
    }

    #[test]
    fn test_descendant_before_ancestor_is_fine() {
        let classes = ClassRegistry::new();
        let sink = CollectingSink::new();
        audit_clauses(
            &classes,
            &sink,
            here(),
            &[
                (builtin::SEGMENTATION, here()),
                (builtin::RUNTIME_ERROR, here()),
                (builtin::EXCEPTION, here()),
            ],
        );
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_no_clauses_warned() {
        let classes = ClassRegistry::new();
        let sink = CollectingSink::new();
        audit_clauses(&classes, &sink, here(), &[]);
        assert_eq!(sink.count_containing("declares no handler clauses"), 1);
    }
}
