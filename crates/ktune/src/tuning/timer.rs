use ktune_api::CallStats;

/// Accumulates device-side execution time across the launches of one run.
pub trait Timer {
    fn clear(&mut self);
    fn accumulate(&mut self, stats: &CallStats);
    fn accumulated_micros(&self) -> f64;
}

/// Timer fed by device event timestamps.
#[derive(Debug, Clone, Default)]
pub struct ProfilingTimer {
    accumulated_micros: f64,
    launches: u32,
}

impl ProfilingTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> u32 {
        self.launches
    }
}

impl Timer for ProfilingTimer {
    fn clear(&mut self) {
        self.accumulated_micros = 0.0;
        self.launches = 0;
    }

    fn accumulate(&mut self, stats: &CallStats) {
        self.accumulated_micros += stats.elapsed_micros().max(0) as f64;
        self.launches += 1;
    }

    fn accumulated_micros(&self) -> f64 {
        self.accumulated_micros
    }
}
