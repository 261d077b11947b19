pub mod custom_add;

pub use custom_add::{CpuCustomAdd, CustomAddOp, DeviceCustomAdd, DEFAULT_REPEAT};
