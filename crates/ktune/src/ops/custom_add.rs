//! `custom_add`: elementwise `a + b` applied `repeat` times over rank-4 NHWC
//! tensors. Serves as the reference operator for the dispatch engine.

use std::sync::Arc;

use ktune_api::{BufferHandle, ComputeDevice, DataType, DeviceTensor, DispatchError, HostTensor, KernelArg, Result};

use crate::context::OpContext;
use crate::dispatch::tuning_or_run_2d;
use crate::geometry::round_up_div4;
use crate::instrument::OutOfRangeFlag;
use crate::kernel::{KernelSlot, KernelSpec};
use crate::tensor;

pub const DEFAULT_REPEAT: i32 = 64;
const OP_TYPE: &str = "CustomAdd";

fn nhwc(shape: &[usize], which: &str) -> Result<[usize; 4]> {
    <[usize; 4]>::try_from(shape).map_err(|_| {
        DispatchError::ShapeMismatch(format!(
            "custom_add: {which} must be rank 4 (NHWC), got shape {shape:?}"
        ))
    })
}

fn check_same_shape(a: &[usize], b: &[usize]) -> Result<[usize; 4]> {
    let dims = nhwc(a, "input 0")?;
    nhwc(b, "input 1")?;
    if a != b {
        return Err(DispatchError::ShapeMismatch(format!(
            "custom_add: input shapes differ: {a:?} vs {b:?}"
        )));
    }
    Ok(dims)
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        DispatchError::InvalidGeometry(format!("custom_add: {what} of {value} does not fit in u32"))
    })
}

/// Reference implementation on host tensors.
#[derive(Debug, Clone)]
pub struct CpuCustomAdd {
    repeat: i32,
}

impl CpuCustomAdd {
    pub fn new(repeat: i32) -> Self {
        Self { repeat }
    }

    pub fn compute(&self, a: &HostTensor, b: &HostTensor) -> Result<HostTensor> {
        check_same_shape(&a.shape, &b.shape)?;
        let mut out = a.data.clone();
        for _ in 0..self.repeat.max(0) {
            for (o, &x) in out.iter_mut().zip(&b.data) {
                *o += x;
            }
        }
        HostTensor::new(a.shape.clone(), out)
    }
}

/// Device implementation dispatched through the tuner as a 2-D kernel.
///
/// The output buffer is owned by the operator and reallocated when the input
/// shape changes. Shape-dependent arguments are rebound only then; input
/// buffers are rebound whenever the caller passes different ones.
pub struct DeviceCustomAdd {
    name: String,
    repeat: i32,
    kernel: KernelSlot,
    out_of_range: Option<OutOfRangeFlag>,
    output: Option<DeviceTensor>,
    bound_inputs: Option<(BufferHandle, BufferHandle)>,
    device: Option<Arc<dyn ComputeDevice>>,
}

impl DeviceCustomAdd {
    pub fn new(name: impl Into<String>, repeat: i32) -> Self {
        Self {
            name: name.into(),
            repeat,
            kernel: KernelSlot::new(),
            out_of_range: None,
            output: None,
            bound_inputs: None,
            device: None,
        }
    }

    pub fn tuning_key(shape: &[usize; 4]) -> String {
        format!(
            "custom_add_kernel_{}_{}_{}_{}",
            shape[0], shape[1], shape[2], shape[3]
        )
    }

    pub fn compute(
        &mut self,
        ctx: &mut OpContext<'_>,
        a: &DeviceTensor,
        b: &DeviceTensor,
    ) -> Result<DeviceTensor> {
        let [batch, height, width, channels] = check_same_shape(&a.shape, &b.shape)?;
        if a.dtype != DataType::Float || b.dtype != DataType::Float {
            return Err(DispatchError::Unsupported(format!(
                "custom_add on {} tensors",
                a.dtype
            )));
        }
        let runtime = ctx.runtime();
        let device = runtime.device();

        let spec = KernelSpec::new("custom_add", "custom_add", DataType::Float);
        let kernel = self.kernel.get_or_build(runtime, &spec)?;
        let kwg = kernel.max_work_group_size();

        let gws = [
            to_u32(round_up_div4(to_u32(channels, "channels")?) as usize * width, "width")?,
            to_u32(batch * height, "batch * height")?,
        ];

        let flag = self
            .out_of_range
            .get_or_insert_with(|| OutOfRangeFlag::new(runtime));
        flag.arm(kernel.handle())?;

        if kernel.needs_rebind(&a.shape) {
            if let Some(old) = self.output.take() {
                tensor::release(device, &old);
            }
            let output = tensor::empty(device, &a.shape)?;
            self.device.get_or_insert_with(|| runtime.device_arc());
            let base = flag.arg_offset();
            let handle = kernel.handle();
            device.set_arg(handle, base, KernelArg::U32(gws[0]))?;
            device.set_arg(handle, base + 1, KernelArg::U32(gws[1]))?;
            device.set_arg(handle, base + 4, KernelArg::I32(self.repeat))?;
            device.set_arg(handle, base + 5, KernelArg::U32(to_u32(width, "width")?))?;
            device.set_arg(handle, base + 6, KernelArg::U32(to_u32(channels, "channels")?))?;
            device.set_arg(handle, base + 7, KernelArg::Buffer(output.buffer))?;
            kernel.mark_bound(&a.shape);
            self.output = Some(output);
        }
        if self.bound_inputs != Some((a.buffer, b.buffer)) {
            let base = flag.arg_offset();
            let handle = kernel.handle();
            device.set_arg(handle, base + 2, KernelArg::Buffer(a.buffer))?;
            device.set_arg(handle, base + 3, KernelArg::Buffer(b.buffer))?;
            self.bound_inputs = Some((a.buffer, b.buffer));
        }

        let lws = [(kwg / 16).max(1), 16u32.min(kwg).max(1)];
        let key = Self::tuning_key(&[batch, height, width, channels]);
        tuning_or_run_2d(ctx, kernel, &key, gws, lws)?;

        if ctx.fake_warmup() {
            return self.output.clone().ok_or_else(|| {
                DispatchError::Device("custom_add: output not allocated".to_string())
            });
        }
        flag.validate()?;
        ctx.record_operator(&self.name, OP_TYPE, &a.shape)?;

        self.output
            .clone()
            .ok_or_else(|| DispatchError::Device("custom_add: output not allocated".to_string()))
    }
}

impl Drop for DeviceCustomAdd {
    fn drop(&mut self) {
        if let (Some(output), Some(device)) = (self.output.take(), self.device.as_ref()) {
            tensor::release(device.as_ref(), &output);
        }
    }
}

/// `custom_add` in one of its two implementations.
pub enum CustomAddOp {
    Cpu(CpuCustomAdd),
    Device(DeviceCustomAdd),
}

impl CustomAddOp {
    pub fn cpu() -> Self {
        CustomAddOp::Cpu(CpuCustomAdd::new(DEFAULT_REPEAT))
    }

    pub fn device(name: impl Into<String>) -> Self {
        CustomAddOp::Device(DeviceCustomAdd::new(name, DEFAULT_REPEAT))
    }

    /// Replace the repeat count. Meant for freshly constructed operators.
    pub fn with_repeat(self, repeat: i32) -> Self {
        match self {
            CustomAddOp::Cpu(_) => CustomAddOp::Cpu(CpuCustomAdd::new(repeat)),
            CustomAddOp::Device(op) => CustomAddOp::Device(DeviceCustomAdd::new(op.name.as_str(), repeat)),
        }
    }

    /// Run on host tensors. The device variant uploads the inputs, dispatches
    /// and downloads the result.
    pub fn run(&mut self, ctx: &mut OpContext<'_>, a: &HostTensor, b: &HostTensor) -> Result<HostTensor> {
        match self {
            CustomAddOp::Cpu(op) => op.compute(a, b),
            CustomAddOp::Device(op) => {
                let device = ctx.runtime().device();
                let da = tensor::upload(device, a)?;
                let db = match tensor::upload(device, b) {
                    Ok(db) => db,
                    Err(err) => {
                        tensor::release(device, &da);
                        return Err(err);
                    }
                };
                let result = op
                    .compute(ctx, &da, &db)
                    .and_then(|out| {
                        ctx.wait()?;
                        tensor::download(device, &out)
                    });
                tensor::release(device, &da);
                tensor::release(device, &db);
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_adds_repeat_times() {
        let a = HostTensor::new(vec![1, 1, 2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).expect("a");
        let b = HostTensor::new(vec![1, 1, 2, 3], vec![1.0; 6]).expect("b");
        let out = CpuCustomAdd::new(3).compute(&a, &b).expect("compute");
        assert_eq!(out.shape, vec![1, 1, 2, 3]);
        assert_eq!(out.data, vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn cpu_rejects_mismatched_shapes() {
        let a = HostTensor::zeros(vec![1, 2, 2, 1]);
        let b = HostTensor::zeros(vec![1, 2, 1, 2]);
        let err = CpuCustomAdd::new(1).compute(&a, &b).expect_err("mismatch");
        assert!(matches!(err, DispatchError::ShapeMismatch(_)));

        let flat = HostTensor::zeros(vec![4]);
        let err = CpuCustomAdd::new(1).compute(&flat, &flat).expect_err("rank");
        assert!(matches!(err, DispatchError::ShapeMismatch(_)));
    }

    #[test]
    fn tuning_key_names_the_shape() {
        assert_eq!(
            DeviceCustomAdd::tuning_key(&[1, 2, 3, 4]),
            "custom_add_kernel_1_2_3_4"
        );
    }
}
