//! Moving f32 tensors between the host and a device.

use ktune_api::{ComputeDevice, DataType, DeviceTensor, DispatchError, HostTensor, Result};

pub fn upload(device: &dyn ComputeDevice, host: &HostTensor) -> Result<DeviceTensor> {
    let bytes: &[u8] = bytemuck::cast_slice(&host.data);
    let buffer = device.create_buffer(bytes.len().max(4))?;
    if !bytes.is_empty() {
        device.write_buffer(&buffer, 0, bytes)?;
    }
    Ok(DeviceTensor {
        shape: host.shape.clone(),
        dtype: DataType::Float,
        buffer,
    })
}

pub fn download(device: &dyn ComputeDevice, tensor: &DeviceTensor) -> Result<HostTensor> {
    if tensor.dtype != DataType::Float {
        return Err(DispatchError::Unsupported(format!(
            "download of {} tensors",
            tensor.dtype
        )));
    }
    let bytes = device.read_buffer(&tensor.buffer)?;
    let len = tensor.len();
    let needed = len * std::mem::size_of::<f32>();
    if bytes.len() < needed {
        return Err(DispatchError::ShapeMismatch(format!(
            "buffer of {} bytes cannot hold tensor of shape {:?}",
            bytes.len(),
            tensor.shape
        )));
    }
    let data: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes[..needed]);
    HostTensor::new(tensor.shape.clone(), data)
}

/// Allocate an f32 device tensor. Backends hand out zeroed buffers.
pub fn empty(device: &dyn ComputeDevice, shape: &[usize]) -> Result<DeviceTensor> {
    let len: usize = shape.iter().product();
    let buffer = device.create_buffer((len * std::mem::size_of::<f32>()).max(4))?;
    Ok(DeviceTensor {
        shape: shape.to_vec(),
        dtype: DataType::Float,
        buffer,
    })
}

pub fn release(device: &dyn ComputeDevice, tensor: &DeviceTensor) {
    device.release_buffer(&tensor.buffer);
}
