//! Core library for wasmforge: builds native-extension packages for
//! WebAssembly from declarative recipes.
//!
//! The pipeline: load recipes ([`recipe`]), select targets and resolve the
//! dependency closure into a DAG ([`graph`]), then build each recipe in
//! dependency order with bounded parallelism ([`orchestrate`]). Build scripts
//! see a toolchain of compiler shims ([`wrapper`]) that rewrite host compiler
//! invocations for the wasm target, and finished outputs land in an artifact
//! store ([`artifact`]).

pub mod artifact;
pub mod config;
pub mod graph;
pub mod orchestrate;
pub mod recipe;
pub mod source;
pub mod wrapper;
