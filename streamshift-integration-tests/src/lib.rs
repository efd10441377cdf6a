//! Integration tests for `StreamShift`
//!
//! This crate contains integration tests that drive the cutover engine end to
//! end against the in-memory adapters and the chaos wrapper from
//! `streamshift-testing`.

// This is a test-only crate
#![cfg(test)]
