//! Test fixtures for flowcore: recording handlers, a store with injected
//! faults and engines wired to a manual clock.

mod fixtures;
mod handlers;
mod store;

pub use fixtures::*;
pub use handlers::*;
pub use store::*;
