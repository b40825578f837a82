//! Compose descriptor support
//!
//! This module reads compose-style deployment descriptors into plain
//! configuration types. Resolution into a launchable plan lives in
//! [`crate::plan`].

pub mod config;
pub mod parser;

pub use config::{ComposeConfig, ServiceConfig, VolumeConfig};
pub use parser::ComposeParser;
