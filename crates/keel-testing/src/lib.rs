//! Testing utilities for keel dispatch groups.
//!
//! - [`counter`]: a small counter domain with one action per interesting
//!   transition outcome (mutation, no-mutation, failure, panic)
//! - [`Tracked`]: wraps any transition and records call and overlap counts
//! - stream helpers that never hang a test: [`next_within`],
//!   [`take_within`], [`assert_quiet`], [`wait_for_version`]

pub mod counter;
mod tracked;
mod streams;

pub use tracked::{CallStats, Tracked};
pub use streams::{assert_quiet, next_within, take_within, wait_for_version, DEFAULT_WAIT};
