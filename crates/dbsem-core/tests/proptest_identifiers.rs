//! Semaphore name property-based tests.
// crates/dbsem-core/tests/proptest_identifiers.rs
// ============================================================================
// Module: Identifier Property-Based Tests
// Description: Randomized checks for semaphore name parsing.
// Purpose: Ensure untrusted names are trimmed or rejected without panics.
// ============================================================================

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use dbsem_core::IdentifierError;
use dbsem_core::MAX_SEMAPHORE_NAME_LENGTH;
use dbsem_core::SemaphoreName;
use proptest::prelude::*;

proptest! {
    #[test]
    fn printable_names_parse_trimmed(raw in "[ ]{0,3}[a-zA-Z0-9_.:-]{1,64}[ ]{0,3}") {
        let name = SemaphoreName::parse(&raw).unwrap();
        prop_assert_eq!(name.as_str(), raw.trim());
    }

    #[test]
    fn control_characters_are_rejected(prefix in "[a-z]{1,16}", suffix in "[a-z]{0,16}") {
        let raw = format!("{prefix}\u{7}{suffix}");
        prop_assert_eq!(SemaphoreName::parse(&raw), Err(IdentifierError::ControlCharacter));
    }

    #[test]
    fn overlong_names_are_rejected(extra in 1usize .. 64) {
        let raw = "x".repeat(MAX_SEMAPHORE_NAME_LENGTH + extra);
        prop_assert_eq!(SemaphoreName::parse(&raw), Err(IdentifierError::TooLong));
    }

    #[test]
    fn arbitrary_input_never_panics(raw in ".{0,200}") {
        let _ = SemaphoreName::parse(&raw);
    }
}

#[test]
fn blank_names_are_rejected() {
    assert_eq!(SemaphoreName::parse("   "), Err(IdentifierError::Empty));
    assert_eq!(SemaphoreName::parse(""), Err(IdentifierError::Empty));
}
