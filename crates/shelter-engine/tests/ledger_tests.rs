//! Handler-clause audit tests
//!
//! The audit is latched per call site: findings are reported on a block's
//! first execution, ever, and never again — including across repeated calls
//! of the same function.

use shelter_engine::{builtin, CollectingSink, EngineOptions, Runtime};

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

fn block_with_duplicate_clause(rt: &Runtime) {
    rt.protect()
        .on(builtin::OUT_OF_MEMORY, |_| ())
        .on(builtin::OUT_OF_MEMORY, |_| ())
        .run(|| ());
}

#[test]
fn test_duplicate_clause_flagged_once_ever() {
    let (rt, sink) = quiet_runtime();
    for _ in 0..5 {
        block_with_duplicate_clause(&rt);
    }
    assert_eq!(sink.count_containing("duplicate handler clause"), 1);
}

fn block_with_superfluous_clause(rt: &Runtime) {
    // The ancestor clause is declared first, so the descendant clause can
    // never run.
    rt.protect()
        .on(builtin::EXCEPTION, |_| ())
        .on(builtin::SEGMENTATION, |_| ())
        .run(|| ());
}

#[test]
fn test_ancestor_then_descendant_flagged_superfluous() {
    let (rt, sink) = quiet_runtime();
    for _ in 0..3 {
        block_with_superfluous_clause(&rt);
    }
    assert_eq!(sink.count_containing("superfluous handler clause"), 1);
    assert_eq!(
        sink.count_containing("`Segmentation`"),
        1,
        "the descendant clause is the flagged one"
    );
}

fn block_without_clauses(rt: &Runtime) {
    rt.protect().finally(|| ()).run(|| ());
}

#[test]
fn test_missing_clauses_warned_once() {
    let (rt, sink) = quiet_runtime();
    for _ in 0..3 {
        block_without_clauses(&rt);
    }
    assert_eq!(sink.count_containing("declares no handler clauses"), 1);
}

#[test]
fn test_distinct_sites_audited_independently() {
    let (rt, sink) = quiet_runtime();

    // Same shape, two different call sites: two reports
    rt.protect()
        .on(builtin::EXCEPTION, |_| ())
        .on(builtin::EXCEPTION, |_| ())
        .run(|| ());
    rt.protect()
        .on(builtin::EXCEPTION, |_| ())
        .on(builtin::EXCEPTION, |_| ())
        .run(|| ());

    assert_eq!(sink.count_containing("duplicate handler clause"), 2);
}

#[test]
fn test_clean_block_reports_nothing() {
    let (rt, sink) = quiet_runtime();
    rt.protect()
        .on(builtin::SEGMENTATION, |_| ())
        .on(builtin::RUNTIME_ERROR, |_| ())
        .on(builtin::EXCEPTION, |_| ())
        .run(|| ());
    assert!(sink.lines().is_empty());
}
