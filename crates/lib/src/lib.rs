//! fnbox-lib: build and deploy orchestration for fnbox
//!
//! This crate decides which function images must be rebuilt, coordinates the
//! buildx builder across concurrent invocations, and merges per-deployment
//! configuration into the shared config store:
//! - `fingerprint`: content hash used as the rebuild-skip key
//! - `lock`: named advisory file locks
//! - `registry` / `builder`: registry topology and builder provisioning
//! - `image`: external image reference normalization and digest resolution
//! - `bake`: bake target assembly and invocation
//! - `merge`: last-write-wins config merge
//! - `deploy`: the orchestrator tying them together

pub mod bake;
pub mod builder;
pub mod config;
pub mod consts;
pub mod deploy;
pub mod exec;
pub mod fingerprint;
pub mod image;
pub mod layer;
pub mod lock;
pub mod merge;
pub mod platform;
pub mod registry;
pub mod staging;
pub mod types;
pub mod util;
