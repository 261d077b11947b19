use std::sync::Arc;

use ktune_api::{ComputeDevice, DispatchTelemetry, Result};

use crate::config::DispatchConfig;
use crate::context::OpContext;
use crate::kernel::{obfuscate_symbol, BuiltKernel, KernelSpec, ProgramCache};
use crate::telemetry::DispatchCounters;
use crate::tuning::{InMemoryTuningStore, JsonFileTuningStore, Tuner, TuningStore};

/// Everything shared by the operators dispatching onto one device: the
/// device itself, configuration, the tuner and the program cache.
pub struct Runtime {
    device: Arc<dyn ComputeDevice>,
    config: DispatchConfig,
    tuner: Tuner,
    programs: ProgramCache,
    counters: Arc<DispatchCounters>,
}

impl Runtime {
    /// Create a runtime, opening the tuning table named by the config when
    /// one is set.
    pub fn new(device: Arc<dyn ComputeDevice>, config: DispatchConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn TuningStore> = match &config.tuning_params_path {
            Some(path) => Arc::new(JsonFileTuningStore::open(path)?),
            None => Arc::new(InMemoryTuningStore::new()),
        };
        Ok(Self::with_store(device, config, store))
    }

    pub fn with_store(
        device: Arc<dyn ComputeDevice>,
        config: DispatchConfig,
        store: Arc<dyn TuningStore>,
    ) -> Self {
        let counters = Arc::new(DispatchCounters::new());
        let tuner = Tuner::new(
            store,
            config.tuning,
            config.queue_window_size,
            counters.clone(),
        );
        let info = device.info();
        log::info!(
            "ktune runtime on '{}' ({}, {}): tuning={} limit_kernel_time={} out_of_range_check={}",
            info.name,
            info.vendor,
            info.backend,
            config.tuning,
            config.limit_kernel_time,
            config.out_of_range_check
        );
        Self {
            device,
            config,
            tuner,
            programs: ProgramCache::new(),
            counters,
        }
    }

    pub fn device(&self) -> &dyn ComputeDevice {
        self.device.as_ref()
    }

    pub fn device_arc(&self) -> Arc<dyn ComputeDevice> {
        self.device.clone()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn tuner(&self) -> &Tuner {
        &self.tuner
    }

    pub fn programs(&self) -> &ProgramCache {
        &self.programs
    }

    pub(crate) fn counters(&self) -> &DispatchCounters {
        &self.counters
    }

    pub fn telemetry(&self) -> DispatchTelemetry {
        self.counters.snapshot()
    }

    pub fn reset_telemetry(&self) {
        self.counters.reset();
    }

    /// Non-uniform work-groups are used only when both the config allows
    /// them and the device supports them.
    pub fn non_uniform_work_groups(&self) -> bool {
        self.config.non_uniform_work_groups && self.device.capabilities().non_uniform_work_groups
    }

    pub fn out_of_range_check(&self) -> bool {
        self.config.out_of_range_check
    }

    /// Build (or fetch from the program cache) and instantiate a kernel.
    pub fn build_kernel(&self, spec: &KernelSpec) -> Result<BuiltKernel> {
        let symbol = if self.config.obfuscate_symbols {
            obfuscate_symbol(&spec.entry)
        } else {
            spec.entry.clone()
        };
        let options =
            spec.build_options(&symbol, self.out_of_range_check(), self.non_uniform_work_groups());
        let program = self.programs.get_or_build(
            self.device.as_ref(),
            &spec.program,
            &options,
            &self.counters,
        )?;
        let handle = self.device.create_kernel(program, &symbol)?;
        let kwg = match self.device.kernel_max_work_group_size(&handle) {
            Ok(kwg) => kwg,
            Err(err) => {
                self.device.release_kernel(&handle);
                return Err(err);
            }
        };
        log::debug!(
            "built kernel '{}' as '{symbol}' (max work-group size {kwg})",
            spec.entry
        );
        Ok(BuiltKernel::new(self.device.clone(), handle, kwg))
    }

    /// Fresh issuing context for one thread.
    pub fn context(&self) -> OpContext<'_> {
        OpContext::new(self)
    }
}
