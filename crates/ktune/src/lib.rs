//! ktune: compute-kernel dispatch and launch-geometry autotuning.
//!
//! Goals:
//! - Build kernels once per build-option set and cache the resulting programs.
//! - Choose local work-group sizes by measurement, persist the winners and
//!   replay them without timing on later runs.
//! - Keep individual launches under a wall-clock ceiling by splitting them
//!   along the outermost dimension.
//! - Bound the number of unsynchronised launches in flight.
//! - Optionally instrument kernels with an out-of-range write flag.
//!
//! Devices plug in through [`ktune_api::ComputeDevice`]. A deterministic host
//! device is always available; the `wgpu` feature adds a GPU backend.

pub mod backend;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod geometry;
pub mod instrument;
pub mod kernel;
pub mod ops;
pub mod runtime;
pub mod splitter;
pub mod telemetry;
pub mod tensor;
pub mod throttle;
pub mod tuning;

pub use ktune_api;

pub use backend::host::{HostDevice, HostDeviceOptions};
pub use config::DispatchConfig;
pub use context::OpContext;
pub use dispatch::{tuning_or_run_2d, tuning_or_run_3d};
pub use geometry::LaunchGeometry;
pub use instrument::OutOfRangeFlag;
pub use kernel::{BuiltKernel, KernelSlot, KernelSpec};
pub use ops::CustomAddOp;
pub use runtime::Runtime;
pub use tuning::{InMemoryTuningStore, JsonFileTuningStore, Tuner, TuningStore};
