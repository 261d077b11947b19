use ktune_api::NdRange;

/// Virtual execution time of one enqueue on the host device.
pub trait CostModel: Send + Sync {
    fn launch_nanos(&self, kernel: &str, range: &NdRange) -> u64;
}

/// Fixed per-launch overhead plus a per-work-item cost.
#[derive(Debug, Clone, Copy)]
pub struct LinearCostModel {
    pub launch_overhead_ns: u64,
    pub per_item_ns: u64,
}

impl Default for LinearCostModel {
    fn default() -> Self {
        Self {
            launch_overhead_ns: 5_000,
            per_item_ns: 10,
        }
    }
}

impl CostModel for LinearCostModel {
    fn launch_nanos(&self, _kernel: &str, range: &NdRange) -> u64 {
        self.launch_overhead_ns + self.per_item_ns * range.work_items()
    }
}

impl<F> CostModel for F
where
    F: Fn(&str, &NdRange) -> u64 + Send + Sync,
{
    fn launch_nanos(&self, kernel: &str, range: &NdRange) -> u64 {
        self(kernel, range)
    }
}
