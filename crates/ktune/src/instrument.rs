use std::sync::Arc;

use ktune_api::{BufferHandle, ComputeDevice, KernelArg, KernelHandle, Result};

use crate::runtime::Runtime;

/// Device-side out-of-range flag for kernels built with `OUT_OF_RANGE_CHECK`.
///
/// When enabled the flag buffer is zeroed and bound as argument 0 before each
/// run; the kernel writes a non-zero code into it on an out-of-range access.
/// All other arguments shift by [`OutOfRangeFlag::arg_offset`].
pub struct OutOfRangeFlag {
    device: Arc<dyn ComputeDevice>,
    enabled: bool,
    buffer: Option<BufferHandle>,
}

impl OutOfRangeFlag {
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            device: runtime.device_arc(),
            enabled: runtime.out_of_range_check(),
            buffer: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Index of the first regular kernel argument.
    pub fn arg_offset(&self) -> u32 {
        u32::from(self.enabled)
    }

    /// Zero the flag and bind it to `kernel`.
    pub fn arm(&mut self, kernel: &KernelHandle) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let buffer = match self.buffer {
            Some(buffer) => buffer,
            None => {
                let buffer = self.device.create_buffer(std::mem::size_of::<i32>())?;
                self.buffer = Some(buffer);
                buffer
            }
        };
        self.device
            .write_buffer(&buffer, 0, bytemuck::bytes_of(&0i32))?;
        self.device.set_arg(kernel, 0, KernelArg::Buffer(buffer))
    }

    /// Current flag value; 0 when disabled or never armed.
    pub fn read_code(&self) -> Result<i32> {
        let Some(buffer) = self.buffer.filter(|_| self.enabled) else {
            return Ok(0);
        };
        let bytes = self.device.read_buffer(&buffer)?;
        Ok(bytes
            .get(..4)
            .map(bytemuck::pod_read_unaligned::<i32>)
            .unwrap_or(0))
    }

    /// Check the flag after a run.
    ///
    /// # Panics
    ///
    /// Panics with `Kernel error code: <code>` when the kernel reported an
    /// out-of-range access.
    pub fn validate(&self) -> Result<()> {
        let code = self.read_code()?;
        if code != 0 {
            log::error!("out-of-range access reported by kernel, code {code}");
        }
        assert!(code == 0, "Kernel error code: {code}");
        Ok(())
    }
}

impl Drop for OutOfRangeFlag {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.device.release_buffer(&buffer);
        }
    }
}
