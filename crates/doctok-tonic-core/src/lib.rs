#![doc = include_str!("../README.md")]

mod common;
pub use common::*;
// Public re-export so downstream crates can reach the orchestrator via
// `doctok_tonic_core::doctok`
pub use doctok;
