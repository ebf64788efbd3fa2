//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. The typing engine
//! waits on its condvar with a deadline, the CLI waits on stdin and the
//! conductor channel.

use architectural_enforcement::find_violations;

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_violations(
        &["conductor/core/src", "conductor/cli/src"],
        &["::sleep(", ".sleep(", "sleep_ms("],
    );

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nWait on a condvar, a channel or I/O instead.");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}
