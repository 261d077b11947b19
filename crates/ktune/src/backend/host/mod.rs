//! Host backend: a [`ktune_api::ComputeDevice`] that executes Rust kernels
//! in-process. Always available; used as the fallback device and in tests.

mod cost;
mod device;
mod programs;

pub use cost::{CostModel, LinearCostModel};
pub use device::{HostDevice, HostDeviceOptions, HostDeviceStats};
pub use programs::{builtin_programs, HostKernelFn, HostProgram, KernelMemory, WorkItem};
