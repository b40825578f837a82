//! Rune Launch - declarative service-dependency launcher
//!
//! Reads a compose-style descriptor and brings its services up in
//! dependency order through a container runtime:
//!
//! - Descriptor parsing, merging and variable interpolation
//! - Validation into an immutable deployment plan (cycles, unknown
//!   dependencies, host port conflicts, undefined volumes)
//! - Concurrent, dependency-ordered launch with readiness probing
//! - Failure propagation to dependents and teardown in reverse order

pub mod compose;
pub mod error;
pub mod launcher;
pub mod plan;
pub mod runtime;

pub use error::{LaunchError, Result};
