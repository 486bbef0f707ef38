//! Reference CPU backend for fully typed graphs.
//!
//! The backend compiles a graph whose shapes are all static into a list of
//! f32 kernel steps. It needs the process-wide [`Runtime`], which
//! [`CpuBackend::compile`] brings up on first use; flags are read from
//! `OPGRAPH_CPU_OPTIONS` at that point.

pub mod backend;
pub mod kernels;
pub mod runtime;

pub use backend::{CpuBackend, CpuExecutable};
pub use runtime::{CpuOptions, Runtime, ensure_initialized, is_initialized, shutdown};
