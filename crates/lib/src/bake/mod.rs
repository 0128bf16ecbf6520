//! Bake target assembly and invocation.
//!
//! Images are produced by `docker buildx bake` from a JSON definition
//! generated per run and layered over the repository's `docker-bake.hcl`.
//!
//! # Submodules
//!
//! - [`images`] - base and function groups with rebuild skipping
//! - [`run`] - definition file, argument assembly, and the locked invocation

pub mod images;
pub mod run;
mod types;

pub use types::*;
