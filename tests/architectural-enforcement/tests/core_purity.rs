//! Integration Test: Core Library Purity
//!
//! **Policy**: `storyloom-core` never writes to stdout/stderr (it logs through
//! `tracing`) and never panics on `unwrap()`/`expect()` outside tests.

use architectural_enforcement::find_violations;

const CORE: &[&str] = &["conductor/core/src"];

#[test]
fn test_no_printing_in_core() {
    let violations = find_violations(CORE, &["print!(", "println!(", "eprint!(", "eprintln!(", "dbg!("]);

    assert!(
        violations.is_empty(),
        "Printing found in the core library (use tracing):\n{}",
        violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    );
}

#[test]
fn test_no_unwrap_in_core() {
    let violations = find_violations(CORE, &[".unwrap()", ".expect("]);

    assert!(
        violations.is_empty(),
        "unwrap/expect found in core production code:\n{}",
        violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    );
}
