//! Small shared utilities.

pub mod state_guard;

pub use state_guard::{GuardState, StateGuard};
