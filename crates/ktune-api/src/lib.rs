//! Shared types for the ktune dispatch engine.
//!
//! This crate defines the [`ComputeDevice`] abstraction that backends implement,
//! the handle types the engine passes around, the launch-range description and
//! the profiling records (`CallStats`, `RunMetadata`) that flow back to callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Compile-time define that turns on out-of-range instrumentation in kernels.
pub const OUT_OF_RANGE_CHECK: &str = "OUT_OF_RANGE_CHECK";
/// Compile-time define announcing that the launch may use non-uniform work-groups.
pub const NON_UNIFORM_WORK_GROUP: &str = "NON_UNIFORM_WORK_GROUP";
/// Compile-time define carrying the element type name.
pub const DATA_TYPE: &str = "DATA_TYPE";
/// Compile-time define carrying the element-type command token.
pub const CMD_DATA_TYPE: &str = "CMD_DATA_TYPE";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("failed to build program '{program}': {message}")]
    Build { program: String, message: String },
    #[error("failed to enqueue kernel '{kernel}': {message}")]
    Enqueue { kernel: String, message: String },
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("invalid launch geometry: {0}")]
    InvalidGeometry(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("unknown handle: {0}")]
    UnknownHandle(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Element type of device buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    Half,
    Float,
    Int32,
    UInt8,
}

impl DataType {
    /// Device-language scalar type name used for the `DATA_TYPE` define.
    pub fn device_type_name(self) -> &'static str {
        match self {
            DataType::Half => "half",
            DataType::Float => "float",
            DataType::Int32 => "int",
            DataType::UInt8 => "uchar",
        }
    }

    /// Short token used for typed read/write helpers (`CMD_DATA_TYPE`).
    /// Only floating point types have one.
    pub fn command_token(self) -> Option<&'static str> {
        match self {
            DataType::Half => Some("h"),
            DataType::Float => Some("f"),
            DataType::Int32 | DataType::UInt8 => None,
        }
    }

    pub fn size_bytes(self) -> usize {
        match self {
            DataType::Half => 2,
            DataType::Float | DataType::Int32 => 4,
            DataType::UInt8 => 1,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.device_type_name())
    }
}

/// Preprocessor defines passed to a program build. Ordered so that the same
/// set of options always renders to the same flag list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BuildOptions {
    defines: BTreeMap<String, Option<String>>,
}

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: impl Into<String>) -> &mut Self {
        self.defines.insert(name.into(), None);
        self
    }

    pub fn define_value(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.defines.insert(name.into(), Some(value.into()));
        self
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defines.contains_key(name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.defines.get(name).and_then(|v| v.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.defines.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Render as compiler flags (`-DNAME` / `-DNAME=value`).
    pub fn to_flags(&self) -> Vec<String> {
        self.iter()
            .map(|(name, value)| match value {
                Some(v) => format!("-D{name}={v}"),
                None => format!("-D{name}"),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelHandle {
    pub id: u64,
    pub program: ProgramId,
    pub symbol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub id: u64,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    pub id: u64,
}

/// A single kernel argument value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(BufferHandle),
    U32(u32),
    I32(i32),
    F32(f32),
}

impl KernelArg {
    pub fn as_buffer(&self) -> Option<BufferHandle> {
        match self {
            KernelArg::Buffer(b) => Some(*b),
            _ => None,
        }
    }

    /// Raw 32-bit payload of a scalar argument.
    pub fn scalar_bits(&self) -> Option<u32> {
        match *self {
            KernelArg::U32(v) => Some(v),
            KernelArg::I32(v) => Some(v as u32),
            KernelArg::F32(v) => Some(v.to_bits()),
            KernelArg::Buffer(_) => None,
        }
    }
}

/// Offset, global and local extents of one enqueue. All three vectors have
/// the same length (1 to 3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NdRange {
    pub offset: Vec<u32>,
    pub global: Vec<u32>,
    pub local: Vec<u32>,
}

impl NdRange {
    pub fn new(offset: Vec<u32>, global: Vec<u32>, local: Vec<u32>) -> Self {
        Self {
            offset,
            global,
            local,
        }
    }

    pub fn dims(&self) -> usize {
        self.global.len()
    }

    pub fn work_items(&self) -> u64 {
        self.global.iter().map(|&g| g as u64).product()
    }

    pub fn local_items(&self) -> u64 {
        self.local.iter().map(|&l| l as u64).product()
    }

    pub fn validate(&self) -> Result<()> {
        let dims = self.global.len();
        if dims == 0 || dims > 3 {
            return Err(DispatchError::InvalidGeometry(format!(
                "ND-range must have 1 to 3 dimensions, got {dims}"
            )));
        }
        if self.offset.len() != dims || self.local.len() != dims {
            return Err(DispatchError::InvalidGeometry(format!(
                "ND-range dimension mismatch: offset {:?}, global {:?}, local {:?}",
                self.offset, self.global, self.local
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Largest total work-group size any kernel may use on this device.
    pub max_work_group_size: u32,
    /// Whether global extents need not be multiples of the local extents.
    pub non_uniform_work_groups: bool,
    /// Size of the global memory cache in bytes.
    pub global_mem_cache_size: u64,
    pub compute_units: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub backend: String,
}

/// Timestamps of one kernel execution in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStats {
    pub queued_micros: i64,
    pub submit_micros: i64,
    pub start_micros: i64,
    pub end_micros: i64,
}

impl CallStats {
    pub fn elapsed_micros(&self) -> i64 {
        self.end_micros - self.start_micros
    }

    /// Extend this record so it also covers `other`.
    pub fn merge(&mut self, other: &CallStats) {
        if *self == CallStats::default() {
            *self = *other;
            return;
        }
        self.queued_micros = self.queued_micros.min(other.queued_micros);
        self.submit_micros = self.submit_micros.min(other.submit_micros);
        self.start_micros = self.start_micros.min(other.start_micros);
        self.end_micros = self.end_micros.max(other.end_micros);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelLaunchStats {
    pub tuning_key: String,
    pub offset: Vec<u32>,
    pub global: Vec<u32>,
    pub local: Vec<u32>,
    pub stats: CallStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorStats {
    pub operator_name: String,
    pub op_type: String,
    pub output_shape: Vec<Vec<i64>>,
    pub stats: CallStats,
}

/// Per-run profiling output, filled only when the caller asked for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub op_stats: Vec<OperatorStats>,
    pub launches: Vec<KernelLaunchStats>,
}

type WaitFn = Box<dyn Fn(Option<&mut CallStats>) -> Result<()> + Send + Sync>;

/// Completion handle for the most recent dispatch of an operator.
#[derive(Default)]
pub struct StatsFuture {
    wait_fn: Option<WaitFn>,
}

impl StatsFuture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<F>(&mut self, wait_fn: F)
    where
        F: Fn(Option<&mut CallStats>) -> Result<()> + Send + Sync + 'static,
    {
        self.wait_fn = Some(Box::new(wait_fn));
    }

    pub fn clear(&mut self) {
        self.wait_fn = None;
    }

    pub fn is_set(&self) -> bool {
        self.wait_fn.is_some()
    }

    /// Block until the dispatch completes, optionally filling `stats`.
    /// Waiting on an empty future is a no-op.
    pub fn wait(&self, stats: Option<&mut CallStats>) -> Result<()> {
        match &self.wait_fn {
            Some(f) => f(stats),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for StatsFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsFuture")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Snapshot of the engine's dispatch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTelemetry {
    pub dispatches: u64,
    pub enqueues: u64,
    pub timed_launches: u64,
    pub split_dispatches: u64,
    pub tuning_searches: u64,
    pub candidates_measured: u64,
    pub forced_waits: u64,
    pub fake_warmups: u64,
    pub program_cache_hits: u64,
    pub program_cache_misses: u64,
}

/// Host-resident dense f32 tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl HostTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(DispatchError::ShapeMismatch(format!(
                "shape {:?} holds {expected} elements but {} were supplied",
                shape,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Device-resident tensor. The buffer is owned by whoever allocated it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTensor {
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub buffer: BufferHandle,
}

impl DeviceTensor {
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A compute device able to build programs and run kernels over ND-ranges.
///
/// Enqueues on a device execute in submission order. Events returned by
/// [`ComputeDevice::enqueue`] can be waited on and queried for timestamps.
pub trait ComputeDevice: Send + Sync {
    fn info(&self) -> DeviceInfo;

    fn capabilities(&self) -> DeviceCapabilities;

    /// Build the named program source with the given defines.
    fn build_program(&self, source_name: &str, options: &BuildOptions) -> Result<ProgramId>;

    /// Create a kernel object for the entry point exported under `symbol`.
    fn create_kernel(&self, program: ProgramId, symbol: &str) -> Result<KernelHandle>;

    /// Largest work-group size usable by this particular kernel.
    fn kernel_max_work_group_size(&self, kernel: &KernelHandle) -> Result<u32>;

    fn release_kernel(&self, kernel: &KernelHandle);

    fn set_arg(&self, kernel: &KernelHandle, index: u32, arg: KernelArg) -> Result<()>;

    fn enqueue(&self, kernel: &KernelHandle, range: &NdRange) -> Result<EventHandle>;

    /// Block until the event (and everything enqueued before it) completed.
    fn wait(&self, event: EventHandle) -> Result<()>;

    /// Timestamps of a completed event. Implementations wait first if needed.
    fn call_stats(&self, event: EventHandle) -> Result<CallStats>;

    /// Forget `event`. Later waits or queries on it fail with
    /// [`DispatchError::UnknownHandle`].
    fn release_event(&self, event: EventHandle);

    fn create_buffer(&self, size_bytes: usize) -> Result<BufferHandle>;

    fn write_buffer(&self, buffer: &BufferHandle, offset: usize, data: &[u8]) -> Result<()>;

    /// Read back the full buffer after all prior work completed.
    fn read_buffer(&self, buffer: &BufferHandle) -> Result<Vec<u8>>;

    fn release_buffer(&self, buffer: &BufferHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_options_render_sorted_flags() {
        let mut opts = BuildOptions::new();
        opts.define_value("DATA_TYPE", "float")
            .define("OUT_OF_RANGE_CHECK")
            .define_value("custom_add", "k0123");
        assert_eq!(
            opts.to_flags(),
            vec![
                "-DDATA_TYPE=float".to_string(),
                "-DOUT_OF_RANGE_CHECK".to_string(),
                "-Dcustom_add=k0123".to_string(),
            ]
        );
        assert!(opts.is_defined(OUT_OF_RANGE_CHECK));
        assert_eq!(opts.value("DATA_TYPE"), Some("float"));
        assert_eq!(opts.value(OUT_OF_RANGE_CHECK), None);
    }

    #[test]
    fn data_type_tokens() {
        assert_eq!(DataType::Float.device_type_name(), "float");
        assert_eq!(DataType::Half.device_type_name(), "half");
        assert_eq!(DataType::Float.command_token(), Some("f"));
        assert_eq!(DataType::Int32.command_token(), None);
    }

    #[test]
    fn nd_range_validation() {
        let ok = NdRange::new(vec![0, 0], vec![8, 4], vec![4, 2]);
        assert!(ok.validate().is_ok());
        assert_eq!(ok.work_items(), 32);
        let bad = NdRange::new(vec![0], vec![8, 4], vec![4, 2]);
        assert!(matches!(
            bad.validate(),
            Err(DispatchError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn call_stats_merge_spans_both() {
        let mut a = CallStats {
            queued_micros: 5,
            submit_micros: 6,
            start_micros: 10,
            end_micros: 20,
        };
        a.merge(&CallStats {
            queued_micros: 1,
            submit_micros: 2,
            start_micros: 3,
            end_micros: 40,
        });
        assert_eq!(a.start_micros, 3);
        assert_eq!(a.end_micros, 40);
        assert_eq!(a.elapsed_micros(), 37);
    }

    #[test]
    fn empty_future_wait_is_noop() {
        let fut = StatsFuture::new();
        assert!(!fut.is_set());
        let mut stats = CallStats::default();
        fut.wait(Some(&mut stats)).expect("wait");
        assert_eq!(stats, CallStats::default());
    }

    #[test]
    fn host_tensor_checks_len() {
        assert!(HostTensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(matches!(
            HostTensor::new(vec![2, 3], vec![0.0; 5]),
            Err(DispatchError::ShapeMismatch(_))
        ));
    }
}
