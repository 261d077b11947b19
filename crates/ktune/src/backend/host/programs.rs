//! Programs available to the host device.
//!
//! A host program is a named set of Rust kernel functions. Each function is
//! invoked once per work item of an enqueue and reaches its arguments through
//! [`KernelMemory`].

use std::collections::HashMap;
use std::sync::Arc;

use ktune_api::{
    BuildOptions, DataType, DispatchError, KernelArg, Result, DATA_TYPE, OUT_OF_RANGE_CHECK,
};

/// Position of one work item within an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub global_id: [u32; 3],
    pub local_size: [u32; 3],
}

pub type HostKernelFn = Arc<dyn Fn(&WorkItem, &mut KernelMemory<'_>) + Send + Sync>;

/// Argument and buffer access for a running host kernel.
pub struct KernelMemory<'m> {
    args: &'m [KernelArg],
    buffers: &'m mut HashMap<u64, Vec<u8>>,
    out_of_range_check: bool,
}

impl<'m> KernelMemory<'m> {
    pub(crate) fn new(
        args: &'m [KernelArg],
        buffers: &'m mut HashMap<u64, Vec<u8>>,
        out_of_range_check: bool,
    ) -> Self {
        Self {
            args,
            buffers,
            out_of_range_check,
        }
    }

    /// Index of the first regular argument; argument 0 holds the
    /// out-of-range flag in instrumented builds.
    pub fn arg_base(&self) -> u32 {
        u32::from(self.out_of_range_check)
    }

    fn scalar(&self, index: u32) -> u32 {
        self.args
            .get(index as usize)
            .and_then(KernelArg::scalar_bits)
            .unwrap_or(0)
    }

    pub fn u32_arg(&self, index: u32) -> u32 {
        self.scalar(index)
    }

    pub fn i32_arg(&self, index: u32) -> i32 {
        self.scalar(index) as i32
    }

    pub fn f32_arg(&self, index: u32) -> f32 {
        f32::from_bits(self.scalar(index))
    }

    fn buffer_id(&self, index: u32) -> Option<u64> {
        self.args
            .get(index as usize)
            .and_then(KernelArg::as_buffer)
            .map(|b| b.id)
    }

    pub fn len_f32(&self, index: u32) -> usize {
        self.buffer_id(index)
            .and_then(|id| self.buffers.get(&id))
            .map(|b| b.len() / 4)
            .unwrap_or(0)
    }

    /// Reads past the end return 0.
    pub fn load_f32(&self, index: u32, elem: usize) -> f32 {
        self.buffer_id(index)
            .and_then(|id| self.buffers.get(&id))
            .and_then(|b| b.get(elem * 4..elem * 4 + 4))
            .map(bytemuck::pod_read_unaligned::<f32>)
            .unwrap_or(0.0)
    }

    /// Writes past the end are dropped and, in instrumented builds, raise the
    /// out-of-range flag.
    pub fn store_f32(&mut self, index: u32, elem: usize, value: f32) {
        let Some(id) = self.buffer_id(index) else {
            return;
        };
        let stored = self
            .buffers
            .get_mut(&id)
            .and_then(|b| b.get_mut(elem * 4..elem * 4 + 4))
            .map(|slot| slot.copy_from_slice(bytemuck::bytes_of(&value)))
            .is_some();
        if !stored {
            self.raise_out_of_range(1);
        }
    }

    pub fn raise_out_of_range(&mut self, code: i32) {
        if !self.out_of_range_check {
            return;
        }
        if let Some(flag) = self.buffer_id(0).and_then(|id| self.buffers.get_mut(&id)) {
            if let Some(slot) = flag.get_mut(..4) {
                slot.copy_from_slice(bytemuck::bytes_of(&code));
            }
        }
    }
}

#[derive(Clone)]
pub struct HostProgram {
    kernels: HashMap<String, HostKernelFn>,
    data_types: Vec<DataType>,
}

impl Default for HostProgram {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProgram {
    /// An empty program accepting `float` data.
    pub fn new() -> Self {
        Self {
            kernels: HashMap::new(),
            data_types: vec![DataType::Float],
        }
    }

    pub fn with_kernel<F>(mut self, entry: &str, kernel: F) -> Self
    where
        F: Fn(&WorkItem, &mut KernelMemory<'_>) + Send + Sync + 'static,
    {
        self.kernels.insert(entry.to_string(), Arc::new(kernel));
        self
    }

    pub fn with_data_types(mut self, data_types: &[DataType]) -> Self {
        self.data_types = data_types.to_vec();
        self
    }

    pub(crate) fn check_options(&self, source_name: &str, options: &BuildOptions) -> Result<()> {
        if let Some(dt) = options.value(DATA_TYPE) {
            if !self.data_types.iter().any(|t| t.device_type_name() == dt) {
                return Err(DispatchError::Build {
                    program: source_name.to_string(),
                    message: format!("unsupported {DATA_TYPE} '{dt}'"),
                });
            }
        }
        Ok(())
    }

    /// Kernel exported under `symbol`: either an entry renamed to it by a
    /// define, or an entry of that name.
    pub(crate) fn resolve(&self, options: &BuildOptions, symbol: &str) -> Option<HostKernelFn> {
        self.kernels
            .iter()
            .find(|(entry, _)| options.value(entry) == Some(symbol))
            .or_else(|| self.kernels.get_key_value(symbol))
            .map(|(_, f)| f.clone())
    }

    pub(crate) fn out_of_range_check(options: &BuildOptions) -> bool {
        options.is_defined(OUT_OF_RANGE_CHECK)
    }
}

/// Elementwise `out = a + b * repeat` over NHWC f32 buffers, with each work
/// item covering up to four channels of one pixel.
///
/// Arguments: gws0, gws1, input0, input1, repeat, width, channels, output.
fn custom_add(item: &WorkItem, mem: &mut KernelMemory<'_>) {
    let base = mem.arg_base();
    let x = item.global_id[0];
    let hb = item.global_id[1];
    if x >= mem.u32_arg(base) || hb >= mem.u32_arg(base + 1) {
        return;
    }
    let repeat = mem.i32_arg(base + 4).max(0);
    let width = mem.u32_arg(base + 5).max(1);
    let channels = mem.u32_arg(base + 6);
    let ch_blk = x / width;
    let w = x % width;
    for i in 0..4 {
        let c = ch_blk * 4 + i;
        if c >= channels {
            break;
        }
        let idx = ((hb * width + w) * channels + c) as usize;
        let mut value = mem.load_f32(base + 2, idx);
        let addend = mem.load_f32(base + 3, idx);
        for _ in 0..repeat {
            value += addend;
        }
        mem.store_f32(base + 7, idx, value);
    }
}

/// Writes `x + 7y + 31z + 1` at each in-bounds coordinate.
///
/// Arguments: size0, size1, size2, output.
fn fill_index(item: &WorkItem, mem: &mut KernelMemory<'_>) {
    let base = mem.arg_base();
    let [x, y, z] = item.global_id;
    let (g0, g1, g2) = (mem.u32_arg(base), mem.u32_arg(base + 1), mem.u32_arg(base + 2));
    if x >= g0 || y >= g1 || z >= g2 {
        return;
    }
    let idx = ((z * g1 + y) * g0 + x) as usize;
    let value = (x + 7 * y + 31 * z + 1) as f32;
    mem.store_f32(base + 3, idx, value);
}

/// Writes one element past `len` for every work item.
///
/// Arguments: output, len.
fn oob_probe(item: &WorkItem, mem: &mut KernelMemory<'_>) {
    let base = mem.arg_base();
    let len = mem.u32_arg(base + 1) as usize;
    mem.store_f32(base, len + item.global_id[0] as usize, 1.0);
}

pub fn builtin_programs() -> HashMap<String, HostProgram> {
    let mut programs = HashMap::new();
    programs.insert(
        "custom_add".to_string(),
        HostProgram::new().with_kernel("custom_add", custom_add),
    );
    programs.insert(
        "fill_index".to_string(),
        HostProgram::new().with_kernel("fill_index", fill_index),
    );
    programs.insert(
        "oob_probe".to_string(),
        HostProgram::new().with_kernel("oob_probe", oob_probe),
    );
    programs
}
