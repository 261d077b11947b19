use ktune_api::{ComputeDevice, EventHandle, Result};

/// Bounds the number of enqueues issued since the last completion wait.
///
/// Owned by one issuing context; not shared across threads.
#[derive(Debug, Clone, Default)]
pub struct QueueThrottle {
    window: u32,
    outstanding: u32,
}

impl QueueThrottle {
    /// A window of zero or less disables throttling.
    pub fn new(window: i64) -> Self {
        Self {
            window: window.clamp(0, u32::MAX as i64) as u32,
            outstanding: 0,
        }
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn is_enabled(&self) -> bool {
        self.window > 0
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// Account for one enqueue. Waits on `event` once the window is full and
    /// returns whether it did.
    pub fn record(&mut self, device: &dyn ComputeDevice, event: EventHandle) -> Result<bool> {
        if self.window == 0 {
            return Ok(false);
        }
        self.outstanding += 1;
        if self.outstanding >= self.window {
            device.wait(event)?;
            self.outstanding = 0;
            return Ok(true);
        }
        Ok(false)
    }
}
