use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use ktune_api::{
    BufferHandle, BuildOptions, CallStats, ComputeDevice, DeviceCapabilities, DeviceInfo,
    DispatchError, EventHandle, KernelArg, KernelHandle, NdRange, ProgramId, Result,
    NON_UNIFORM_WORK_GROUP,
};

use super::cost::{CostModel, LinearCostModel};
use super::programs::{builtin_programs, HostKernelFn, HostProgram, KernelMemory, WorkItem};

const MAX_KERNEL_ARGS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostDeviceOptions {
    pub max_work_group_size: u32,
    pub non_uniform_work_groups: bool,
    pub global_mem_cache_size: u64,
    pub compute_units: u32,
}

impl Default for HostDeviceOptions {
    fn default() -> Self {
        Self {
            max_work_group_size: 256,
            non_uniform_work_groups: true,
            global_mem_cache_size: 64 * 1024,
            compute_units: 4,
        }
    }
}

/// Counters describing what the host device was asked to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostDeviceStats {
    pub programs_built: u64,
    pub enqueues: u64,
    pub waits: u64,
    pub work_items: u64,
}

#[derive(Default)]
struct HostCounters {
    programs_built: AtomicU64,
    enqueues: AtomicU64,
    waits: AtomicU64,
    work_items: AtomicU64,
}

struct BuiltProgram {
    source: String,
    options: BuildOptions,
}

struct HostKernel {
    entry: HostKernelFn,
    args: Vec<Option<KernelArg>>,
    out_of_range_check: bool,
    non_uniform: bool,
}

#[derive(Default)]
struct HostState {
    next_id: u64,
    programs: HashMap<u64, BuiltProgram>,
    kernels: HashMap<u64, HostKernel>,
    buffers: HashMap<u64, Vec<u8>>,
    events: HashMap<u64, CallStats>,
    clock_ns: u64,
}

impl HostState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process device that runs registered Rust kernels over ND-ranges.
///
/// Enqueues execute synchronously and in order. Event timestamps come from a
/// virtual clock advanced by the device's [`CostModel`], so timing-driven
/// behaviour is deterministic.
pub struct HostDevice {
    options: HostDeviceOptions,
    programs: HashMap<String, HostProgram>,
    cost: Box<dyn CostModel>,
    state: Mutex<HostState>,
    counters: HostCounters,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    pub fn new() -> Self {
        Self::with_options(HostDeviceOptions::default())
    }

    pub fn with_options(options: HostDeviceOptions) -> Self {
        Self {
            options,
            programs: builtin_programs(),
            cost: Box::new(LinearCostModel::default()),
            state: Mutex::new(HostState::default()),
            counters: HostCounters::default(),
        }
    }

    pub fn with_cost_model<C: CostModel + 'static>(mut self, cost: C) -> Self {
        self.cost = Box::new(cost);
        self
    }

    pub fn with_program(mut self, name: &str, program: HostProgram) -> Self {
        self.programs.insert(name.to_string(), program);
        self
    }

    pub fn stats(&self) -> HostDeviceStats {
        HostDeviceStats {
            programs_built: self.counters.programs_built.load(Ordering::Relaxed),
            enqueues: self.counters.enqueues.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            work_items: self.counters.work_items.load(Ordering::Relaxed),
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.state().map(|s| s.buffers.len()).unwrap_or(0)
    }

    pub fn live_kernels(&self) -> usize {
        self.state().map(|s| s.kernels.len()).unwrap_or(0)
    }

    /// Events not yet released.
    pub fn live_events(&self) -> usize {
        self.state().map(|s| s.events.len()).unwrap_or(0)
    }

    fn state(&self) -> Result<MutexGuard<'_, HostState>> {
        self.state
            .lock()
            .map_err(|_| DispatchError::Device("host device state poisoned".to_string()))
    }

    fn check_range(&self, kernel: &KernelHandle, host: &HostKernel, range: &NdRange) -> Result<()> {
        let reject = |message: String| DispatchError::Enqueue {
            kernel: kernel.symbol.clone(),
            message,
        };
        range.validate().map_err(|e| reject(e.to_string()))?;
        if range.local.contains(&0) {
            return Err(reject(format!("local size {:?} has an empty axis", range.local)));
        }
        if range.local_items() > self.options.max_work_group_size as u64 {
            return Err(reject(format!(
                "work-group of {} items exceeds the limit of {}",
                range.local_items(),
                self.options.max_work_group_size
            )));
        }
        let non_uniform = self.options.non_uniform_work_groups && host.non_uniform;
        if !non_uniform {
            if let Some(axis) = (0..range.dims()).find(|&i| range.global[i] % range.local[i] != 0) {
                return Err(reject(format!(
                    "global size {:?} is not a multiple of local size {:?} on axis {axis}",
                    range.global, range.local
                )));
            }
        }
        Ok(())
    }
}

fn padded(values: &[u32], fill: u32) -> [u32; 3] {
    let mut out = [fill; 3];
    for (slot, &v) in out.iter_mut().zip(values) {
        *slot = v;
    }
    out
}

impl ComputeDevice for HostDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "host".to_string(),
            vendor: "ktune".to_string(),
            backend: "host".to_string(),
        }
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            max_work_group_size: self.options.max_work_group_size,
            non_uniform_work_groups: self.options.non_uniform_work_groups,
            global_mem_cache_size: self.options.global_mem_cache_size,
            compute_units: self.options.compute_units,
        }
    }

    fn build_program(&self, source_name: &str, options: &BuildOptions) -> Result<ProgramId> {
        let program = self
            .programs
            .get(source_name)
            .ok_or_else(|| DispatchError::Build {
                program: source_name.to_string(),
                message: "no such program source".to_string(),
            })?;
        program.check_options(source_name, options)?;
        let mut state = self.state()?;
        let id = state.next_id();
        state.programs.insert(
            id,
            BuiltProgram {
                source: source_name.to_string(),
                options: options.clone(),
            },
        );
        self.counters.programs_built.fetch_add(1, Ordering::Relaxed);
        log::debug!("host: built '{source_name}' with {:?}", options.to_flags());
        Ok(ProgramId(id))
    }

    fn create_kernel(&self, program: ProgramId, symbol: &str) -> Result<KernelHandle> {
        let mut state = self.state()?;
        let built = state
            .programs
            .get(&program.0)
            .ok_or_else(|| DispatchError::UnknownHandle(format!("program {}", program.0)))?;
        let entry = self
            .programs
            .get(&built.source)
            .and_then(|p| p.resolve(&built.options, symbol))
            .ok_or_else(|| DispatchError::Build {
                program: built.source.clone(),
                message: format!("no kernel exported as '{symbol}'"),
            })?;
        let kernel = HostKernel {
            entry,
            args: Vec::new(),
            out_of_range_check: HostProgram::out_of_range_check(&built.options),
            non_uniform: built.options.is_defined(NON_UNIFORM_WORK_GROUP),
        };
        let id = state.next_id();
        state.kernels.insert(id, kernel);
        Ok(KernelHandle {
            id,
            program,
            symbol: symbol.to_string(),
        })
    }

    fn kernel_max_work_group_size(&self, kernel: &KernelHandle) -> Result<u32> {
        let state = self.state()?;
        if !state.kernels.contains_key(&kernel.id) {
            return Err(DispatchError::UnknownHandle(format!("kernel {}", kernel.symbol)));
        }
        Ok(self.options.max_work_group_size)
    }

    fn release_kernel(&self, kernel: &KernelHandle) {
        if let Ok(mut state) = self.state() {
            state.kernels.remove(&kernel.id);
        }
    }

    fn set_arg(&self, kernel: &KernelHandle, index: u32, arg: KernelArg) -> Result<()> {
        if index >= MAX_KERNEL_ARGS {
            return Err(DispatchError::Device(format!(
                "argument index {index} exceeds {MAX_KERNEL_ARGS}"
            )));
        }
        let mut state = self.state()?;
        if let KernelArg::Buffer(buffer) = arg {
            if !state.buffers.contains_key(&buffer.id) {
                return Err(DispatchError::UnknownHandle(format!("buffer {}", buffer.id)));
            }
        }
        let host = state
            .kernels
            .get_mut(&kernel.id)
            .ok_or_else(|| DispatchError::UnknownHandle(format!("kernel {}", kernel.symbol)))?;
        let index = index as usize;
        if host.args.len() <= index {
            host.args.resize(index + 1, None);
        }
        host.args[index] = Some(arg);
        Ok(())
    }

    fn enqueue(&self, kernel: &KernelHandle, range: &NdRange) -> Result<EventHandle> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        let host = state
            .kernels
            .get(&kernel.id)
            .ok_or_else(|| DispatchError::UnknownHandle(format!("kernel {}", kernel.symbol)))?;
        self.check_range(kernel, host, range)?;
        let args: Vec<KernelArg> = host
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                arg.ok_or_else(|| DispatchError::Enqueue {
                    kernel: kernel.symbol.clone(),
                    message: format!("argument {i} is not set"),
                })
            })
            .collect::<Result<_>>()?;
        for buffer in args.iter().filter_map(KernelArg::as_buffer) {
            if !state.buffers.contains_key(&buffer.id) {
                return Err(DispatchError::UnknownHandle(format!("buffer {}", buffer.id)));
            }
        }
        let entry = host.entry.clone();
        let out_of_range_check = host.out_of_range_check;

        let offset = padded(&range.offset, 0);
        let global = padded(&range.global, 1);
        let local_size = padded(&range.local, 1);
        let mut memory = KernelMemory::new(&args, &mut state.buffers, out_of_range_check);
        for z in 0..global[2] {
            for y in 0..global[1] {
                for x in 0..global[0] {
                    let item = WorkItem {
                        global_id: [offset[0] + x, offset[1] + y, offset[2] + z],
                        local_size,
                    };
                    entry(&item, &mut memory);
                }
            }
        }

        let duration_ns = self.cost.launch_nanos(&kernel.symbol, range);
        let queued_ns = state.clock_ns;
        state.clock_ns += duration_ns;
        let stats = CallStats {
            queued_micros: (queued_ns / 1_000) as i64,
            submit_micros: (queued_ns / 1_000) as i64,
            start_micros: (queued_ns / 1_000) as i64,
            end_micros: (state.clock_ns / 1_000) as i64,
        };
        let id = state.next_id();
        state.events.insert(id, stats);
        self.counters.enqueues.fetch_add(1, Ordering::Relaxed);
        self.counters
            .work_items
            .fetch_add(range.work_items(), Ordering::Relaxed);
        Ok(EventHandle { id })
    }

    fn wait(&self, event: EventHandle) -> Result<()> {
        let state = self.state()?;
        if !state.events.contains_key(&event.id) {
            return Err(DispatchError::UnknownHandle(format!("event {}", event.id)));
        }
        self.counters.waits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn call_stats(&self, event: EventHandle) -> Result<CallStats> {
        let state = self.state()?;
        state
            .events
            .get(&event.id)
            .copied()
            .ok_or_else(|| DispatchError::UnknownHandle(format!("event {}", event.id)))
    }

    fn release_event(&self, event: EventHandle) {
        if let Ok(mut state) = self.state() {
            state.events.remove(&event.id);
        }
    }

    fn create_buffer(&self, size_bytes: usize) -> Result<BufferHandle> {
        let mut state = self.state()?;
        let id = state.next_id();
        state.buffers.insert(id, vec![0u8; size_bytes]);
        Ok(BufferHandle { id, size_bytes })
    }

    fn write_buffer(&self, buffer: &BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let mut state = self.state()?;
        let bytes = state
            .buffers
            .get_mut(&buffer.id)
            .ok_or_else(|| DispatchError::UnknownHandle(format!("buffer {}", buffer.id)))?;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                DispatchError::Device(format!(
                    "write of {} bytes at {offset} overflows buffer of {} bytes",
                    data.len(),
                    bytes.len()
                ))
            })?;
        bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &BufferHandle) -> Result<Vec<u8>> {
        let state = self.state()?;
        state
            .buffers
            .get(&buffer.id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownHandle(format!("buffer {}", buffer.id)))
    }

    fn release_buffer(&self, buffer: &BufferHandle) {
        if let Ok(mut state) = self.state() {
            state.buffers.remove(&buffer.id);
        }
    }
}
