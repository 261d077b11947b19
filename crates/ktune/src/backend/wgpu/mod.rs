//! wgpu backend.

pub mod cache;
pub mod device;
pub mod kernels;
pub mod preprocess;

use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::OnceCell;

pub use device::{WgpuDevice, WgpuDeviceOptions};

/// Process-wide wgpu device, created on first use.
pub fn shared_device(opts: WgpuDeviceOptions) -> Result<Arc<WgpuDevice>> {
    static INSTANCE: OnceCell<Arc<WgpuDevice>> = OnceCell::new();
    INSTANCE
        .get_or_try_init(move || WgpuDevice::new(opts).map(Arc::new))
        .cloned()
}

/// Like [`shared_device`], but logs and returns `None` when no adapter is
/// available.
pub fn try_shared_device() -> Option<Arc<WgpuDevice>> {
    match shared_device(WgpuDeviceOptions::default()) {
        Ok(device) => Some(device),
        Err(e) => {
            log::warn!("ktune: wgpu device initialization failed: {e}");
            None
        }
    }
}
