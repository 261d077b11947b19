//! Kernel build and caching.
//!
//! Programs are built once per (source, options) pair and shared across
//! operators through [`ProgramCache`]. Each operator owns a [`KernelSlot`]
//! that lazily creates its kernel object and remembers the input shape its
//! arguments were last bound for.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use ktune_api::{
    BuildOptions, ComputeDevice, DataType, DispatchError, KernelHandle, ProgramId, Result,
    CMD_DATA_TYPE, DATA_TYPE, NON_UNIFORM_WORK_GROUP, OUT_OF_RANGE_CHECK,
};

use crate::runtime::Runtime;
use crate::telemetry::DispatchCounters;

/// Describes the kernel an operator needs: which program source, which entry
/// point, element type and any operator-specific defines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpec {
    pub program: String,
    pub entry: String,
    pub data_type: DataType,
    pub defines: Vec<(String, Option<String>)>,
}

impl KernelSpec {
    pub fn new(program: impl Into<String>, entry: impl Into<String>, data_type: DataType) -> Self {
        Self {
            program: program.into(),
            entry: entry.into(),
            data_type,
            defines: Vec::new(),
        }
    }

    pub fn define(mut self, name: impl Into<String>) -> Self {
        self.defines.push((name.into(), None));
        self
    }

    pub fn define_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.push((name.into(), Some(value.into())));
        self
    }

    /// Options for building this kernel exported under `symbol`.
    pub fn build_options(&self, symbol: &str, out_of_range_check: bool, non_uniform: bool) -> BuildOptions {
        let mut options = BuildOptions::new();
        options.define_value(self.entry.as_str(), symbol);
        options.define_value(DATA_TYPE, self.data_type.device_type_name());
        if let Some(token) = self.data_type.command_token() {
            options.define_value(CMD_DATA_TYPE, token);
        }
        if out_of_range_check {
            options.define(OUT_OF_RANGE_CHECK);
        }
        if non_uniform {
            options.define(NON_UNIFORM_WORK_GROUP);
        }
        for (name, value) in &self.defines {
            match value {
                Some(v) => options.define_value(name.as_str(), v.as_str()),
                None => options.define(name.as_str()),
            };
        }
        options
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Opaque exported name for an entry point: `k` and the 64-bit FNV-1a hash
/// of the name, identical across builds and toolchains.
pub fn obfuscate_symbol(entry: &str) -> String {
    let hash = entry.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(FNV_PRIME)
    });
    format!("k{hash:016x}")
}

pub fn program_key(source_name: &str, options: &BuildOptions) -> u64 {
    let mut hasher = DefaultHasher::new();
    source_name.hash(&mut hasher);
    for flag in options.to_flags() {
        flag.hash(&mut hasher);
    }
    hasher.finish()
}

/// Built programs shared by every operator on a runtime.
#[derive(Default)]
pub struct ProgramCache {
    programs: Mutex<HashMap<u64, ProgramId>>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(
        &self,
        device: &dyn ComputeDevice,
        source_name: &str,
        options: &BuildOptions,
        counters: &DispatchCounters,
    ) -> Result<ProgramId> {
        let key = program_key(source_name, options);
        if let Some(id) = self.programs.lock().ok().and_then(|g| g.get(&key).copied()) {
            counters.record_program_cache(true);
            return Ok(id);
        }
        counters.record_program_cache(false);
        let id = device.build_program(source_name, options).map_err(|err| {
            log::error!(
                "program '{source_name}' failed to build with {:?}: {err}",
                options.to_flags()
            );
            err
        })?;
        if let Ok(mut guard) = self.programs.lock() {
            // Another thread may have raced us; keep the first entry.
            return Ok(*guard.entry(key).or_insert(id));
        }
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.programs.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A kernel object owned by one operator instance. Released on drop.
pub struct BuiltKernel {
    device: Arc<dyn ComputeDevice>,
    handle: KernelHandle,
    max_work_group_size: u32,
    bound_shape: Option<Vec<usize>>,
}

impl BuiltKernel {
    pub fn new(device: Arc<dyn ComputeDevice>, handle: KernelHandle, max_work_group_size: u32) -> Self {
        Self {
            device,
            handle,
            max_work_group_size,
            bound_shape: None,
        }
    }

    pub fn handle(&self) -> &KernelHandle {
        &self.handle
    }

    pub fn max_work_group_size(&self) -> u32 {
        self.max_work_group_size
    }

    /// Arguments need binding when nothing was bound yet or the input shape
    /// changed since the last binding.
    pub fn needs_rebind(&self, shape: &[usize]) -> bool {
        self.bound_shape.as_deref() != Some(shape)
    }

    pub fn mark_bound(&mut self, shape: &[usize]) {
        self.bound_shape = Some(shape.to_vec());
    }
}

impl Drop for BuiltKernel {
    fn drop(&mut self) {
        self.device.release_kernel(&self.handle);
    }
}

impl std::fmt::Debug for BuiltKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltKernel")
            .field("handle", &self.handle)
            .field("max_work_group_size", &self.max_work_group_size)
            .field("bound_shape", &self.bound_shape)
            .finish()
    }
}

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Empty,
    Ready(BuiltKernel),
    Failed(DispatchError),
}

/// Lazily built kernel of an operator. A failed build is final for the slot.
#[derive(Debug, Default)]
pub struct KernelSlot {
    state: SlotState,
}

impl KernelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, SlotState::Ready(_))
    }

    pub fn get_or_build(&mut self, runtime: &Runtime, spec: &KernelSpec) -> Result<&mut BuiltKernel> {
        if let SlotState::Empty = self.state {
            self.state = match runtime.build_kernel(spec) {
                Ok(kernel) => SlotState::Ready(kernel),
                Err(err) => SlotState::Failed(err),
            };
        }
        match &mut self.state {
            SlotState::Ready(kernel) => Ok(kernel),
            SlotState::Failed(err) => Err(err.clone()),
            SlotState::Empty => Err(DispatchError::Device(format!(
                "kernel '{}' was not built",
                spec.entry
            ))),
        }
    }
}
