//! Test support for `streamshift` backends and migrations
//!
//! - [`contract`]: scenario functions plus the `event_store_contract_tests!`
//!   and `lock_provider_contract_tests!` macros any backend can invoke
//! - [`chaos`]: an [`EventStore`](streamshift::event_store::EventStore)
//!   wrapper that injects failures, optionally only on chosen streams
//! - [`fixtures`]: events and unique identifiers

#![forbid(
    dead_code,
    invalid_value,
    overflowing_literals,
    unconditional_recursion,
    unreachable_pub,
    unused_allocation,
    unsafe_code
)]
#![deny(
    bad_style,
    deprecated,
    meta_variable_misuse,
    non_ascii_idents,
    non_camel_case_types,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_code,
    unused_assignments,
    unused_attributes,
    unused_extern_crates,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_parens,
    unused_results,
    unused_variables
)]
#![warn(missing_docs)]

pub mod chaos;
pub mod contract;
pub mod fixtures;

pub use chaos::*;
