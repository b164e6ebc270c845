//! ember-util - Shared utilities for the Ember runtime.
//!
//! This crate provides the infrastructure every other Ember crate leans on:
//!
//! - `span` - Source location tracking (byte offsets + line/column)
//! - `diagnostic` - Error and warning reporting (`Handler`, `Diagnostic`)
//! - `hash` - FNV-1a hashing shared by value hashing and cache fingerprints
//!
//! It deliberately has no knowledge of tokens, bytecode, or values; those
//! live in the phase crates that depend on this one.

pub mod diagnostic;
pub mod hash;
pub mod span;

pub use diagnostic::{Diagnostic, Handler, Level};
pub use hash::{fnv1a_64, mix_64};
pub use span::Span;
