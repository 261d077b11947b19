use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::anyhow;
use futures::channel::oneshot;
use ktune_api::{
    BufferHandle, BuildOptions, CallStats, ComputeDevice, DeviceCapabilities, DeviceInfo,
    DispatchError, EventHandle, KernelArg, KernelHandle, NdRange, ProgramId, Result, DATA_TYPE,
};
use log::{debug, info};
use pollster::block_on;
use wgpu::util::DeviceExt;

use super::cache::key::compute_pipeline_hash;
use super::cache::registry::{CachedPipeline, PipelineRegistry};
use super::kernels::{self, MAX_SCALAR_ARGS, PARAMS_BINDING};
use super::preprocess::{preprocess, specialize_workgroup};

const PENDING: i64 = -1;

#[derive(Debug, Clone)]
pub struct WgpuDeviceOptions {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
}

impl Default for WgpuDeviceOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}

struct WgpuProgram {
    name: String,
    source: String,
}

struct WgpuKernel {
    program: u64,
    symbol: String,
    args: Vec<Option<KernelArg>>,
}

struct WgpuEvent {
    submission: wgpu::SubmissionIndex,
    queued_micros: i64,
    submit_micros: i64,
    end_micros: AtomicI64,
}

#[derive(Default)]
struct WgpuState {
    next_id: u64,
    programs: HashMap<u64, WgpuProgram>,
    kernels: HashMap<u64, WgpuKernel>,
    buffers: HashMap<u64, Arc<wgpu::Buffer>>,
    events: HashMap<u64, Arc<WgpuEvent>>,
}

impl WgpuState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// [`ComputeDevice`] over a wgpu adapter.
///
/// Programs are WGSL templates (see [`super::kernels`]) preprocessed with the
/// build options. A compute pipeline is specialised per work-group size and
/// cached. wgpu has no non-uniform work-groups, so global sizes must be
/// multiples of the local sizes.
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    templates: HashMap<String, Cow<'static, str>>,
    pipelines: PipelineRegistry,
    state: Mutex<WgpuState>,
    epoch: Instant,
}

fn elapsed_micros(epoch: Instant) -> i64 {
    epoch.elapsed().as_micros() as i64
}

fn wgsl_scalar(options: &BuildOptions) -> std::result::Result<&'static str, String> {
    match options.value(DATA_TYPE).unwrap_or("float") {
        "float" => Ok("f32"),
        "int" => Ok("i32"),
        other => Err(format!("element type '{other}' is not supported by WGSL kernels")),
    }
}

impl WgpuDevice {
    pub fn new(options: WgpuDeviceOptions) -> anyhow::Result<Self> {
        block_on(Self::new_async(options))
    }

    pub async fn new_async(options: WgpuDeviceOptions) -> anyhow::Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                force_fallback_adapter: options.force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| anyhow!("wgpu: no compatible adapter found"))?;
        let adapter_info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("ktune wgpu device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                },
                None,
            )
            .await?;
        info!(
            "ktune wgpu: adapter '{}' ({:?}), max invocations per work-group {}",
            adapter_info.name, adapter_info.backend, limits.max_compute_invocations_per_workgroup
        );
        let templates = ["custom_add", "fill_index"]
            .into_iter()
            .filter_map(|name| kernels::template(name).map(|t| (name.to_string(), Cow::Borrowed(t))))
            .collect();
        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            limits,
            templates,
            pipelines: PipelineRegistry::new(),
            state: Mutex::new(WgpuState::default()),
            epoch: Instant::now(),
        })
    }

    /// Register an additional WGSL template under `name`.
    pub fn with_template(mut self, name: &str, source: impl Into<String>) -> Self {
        self.templates
            .insert(name.to_string(), Cow::Owned(source.into()));
        self
    }

    pub fn cached_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    fn state(&self) -> Result<MutexGuard<'_, WgpuState>> {
        self.state
            .lock()
            .map_err(|_| DispatchError::Device("wgpu device state poisoned".to_string()))
    }

    fn validation_error(&self) -> Option<wgpu::Error> {
        block_on(self.device.pop_error_scope())
    }

    fn check_local(&self, symbol: &str, range: &NdRange) -> Result<([u32; 3], [u32; 3])> {
        let reject = |message: String| DispatchError::Enqueue {
            kernel: symbol.to_string(),
            message,
        };
        range.validate().map_err(|e| reject(e.to_string()))?;
        let mut local = [1u32; 3];
        let mut groups = [1u32; 3];
        let max_local = [
            self.limits.max_compute_workgroup_size_x,
            self.limits.max_compute_workgroup_size_y,
            self.limits.max_compute_workgroup_size_z,
        ];
        for axis in 0..range.dims() {
            let (g, l) = (range.global[axis], range.local[axis]);
            if l == 0 || l > max_local[axis] {
                return Err(reject(format!(
                    "local size {l} on axis {axis} outside 1..={}",
                    max_local[axis]
                )));
            }
            if g % l != 0 {
                return Err(reject(format!(
                    "global size {g} on axis {axis} is not a multiple of local size {l}"
                )));
            }
            let n = g / l;
            if n > self.limits.max_compute_workgroups_per_dimension {
                return Err(reject(format!("{n} work-groups on axis {axis} exceed the device limit")));
            }
            local[axis] = l;
            groups[axis] = n;
        }
        let items: u64 = local.iter().map(|&l| l as u64).product();
        if items > self.limits.max_compute_invocations_per_workgroup as u64 {
            return Err(reject(format!(
                "work-group of {items} invocations exceeds {}",
                self.limits.max_compute_invocations_per_workgroup
            )));
        }
        Ok((local, groups))
    }

    fn pipeline_for(
        &self,
        source: &str,
        symbol: &str,
        local: [u32; 3],
        buffer_bindings: &[u32],
    ) -> Result<Arc<CachedPipeline>> {
        let layout_tag = buffer_bindings
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let key = compute_pipeline_hash(source, symbol, local, &layout_tag);
        if let Some(cached) = self.pipelines.get(&key) {
            return Ok(cached);
        }

        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = buffer_bindings
            .iter()
            .map(|&binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: PARAMS_BINDING,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("ktune-bgl"),
                entries: &entries,
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("ktune-pl"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(symbol),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(specialize_workgroup(source, local))),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(symbol),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: symbol,
            });
        if let Some(err) = self.validation_error() {
            return Err(DispatchError::Enqueue {
                kernel: symbol.to_string(),
                message: format!("pipeline for work-group {local:?} rejected: {err}"),
            });
        }
        debug!("wgpu: specialised '{symbol}' for work-group {local:?}");
        let cached = Arc::new(CachedPipeline {
            pipeline,
            bind_group_layout,
        });
        self.pipelines.insert(key, cached.clone());
        Ok(cached)
    }

    fn event(&self, event: EventHandle) -> Result<Arc<WgpuEvent>> {
        self.state()?
            .events
            .get(&event.id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownHandle(format!("event {}", event.id)))
    }
}

impl ComputeDevice for WgpuDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.adapter_info.name.clone(),
            vendor: format!("{:#06x}", self.adapter_info.vendor),
            backend: format!("wgpu/{:?}", self.adapter_info.backend),
        }
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            max_work_group_size: self.limits.max_compute_invocations_per_workgroup,
            non_uniform_work_groups: false,
            global_mem_cache_size: 0,
            compute_units: 0,
        }
    }

    fn build_program(&self, source_name: &str, options: &BuildOptions) -> Result<ProgramId> {
        let build_error = |message: String| DispatchError::Build {
            program: source_name.to_string(),
            message,
        };
        let template = self
            .templates
            .get(source_name)
            .ok_or_else(|| build_error("no such program source".to_string()))?;
        let mut options = options.clone();
        options.define_value("SCALAR", wgsl_scalar(&options).map_err(build_error)?);
        let source = preprocess(template, &options).map_err(build_error)?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let _probe = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(source_name),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(specialize_workgroup(
                    &source,
                    [1, 1, 1],
                ))),
            });
        if let Some(err) = self.validation_error() {
            return Err(build_error(err.to_string()));
        }

        let mut state = self.state()?;
        let id = state.next_id();
        state.programs.insert(
            id,
            WgpuProgram {
                name: source_name.to_string(),
                source,
            },
        );
        debug!("wgpu: built '{source_name}' with {:?}", options.to_flags());
        Ok(ProgramId(id))
    }

    fn create_kernel(&self, program: ProgramId, symbol: &str) -> Result<KernelHandle> {
        let mut state = self.state()?;
        let built = state
            .programs
            .get(&program.0)
            .ok_or_else(|| DispatchError::UnknownHandle(format!("program {}", program.0)))?;
        if !built.source.contains(&format!("fn {symbol}(")) {
            return Err(DispatchError::Build {
                program: built.name.clone(),
                message: format!("no entry point exported as '{symbol}'"),
            });
        }
        let id = state.next_id();
        state.kernels.insert(
            id,
            WgpuKernel {
                program: program.0,
                symbol: symbol.to_string(),
                args: Vec::new(),
            },
        );
        Ok(KernelHandle {
            id,
            program,
            symbol: symbol.to_string(),
        })
    }

    fn kernel_max_work_group_size(&self, kernel: &KernelHandle) -> Result<u32> {
        if !self.state()?.kernels.contains_key(&kernel.id) {
            return Err(DispatchError::UnknownHandle(format!("kernel {}", kernel.symbol)));
        }
        Ok(self.limits.max_compute_invocations_per_workgroup)
    }

    fn release_kernel(&self, kernel: &KernelHandle) {
        if let Ok(mut state) = self.state() {
            state.kernels.remove(&kernel.id);
        }
    }

    fn set_arg(&self, kernel: &KernelHandle, index: u32, arg: KernelArg) -> Result<()> {
        if index >= PARAMS_BINDING {
            return Err(DispatchError::Device(format!(
                "argument index {index} collides with the parameter binding"
            )));
        }
        let mut state = self.state()?;
        let k = state
            .kernels
            .get_mut(&kernel.id)
            .ok_or_else(|| DispatchError::UnknownHandle(format!("kernel {}", kernel.symbol)))?;
        let index = index as usize;
        if k.args.len() <= index {
            k.args.resize(index + 1, None);
        }
        k.args[index] = Some(arg);
        Ok(())
    }

    fn enqueue(&self, kernel: &KernelHandle, range: &NdRange) -> Result<EventHandle> {
        let (local, groups) = self.check_local(&kernel.symbol, range)?;
        let reject = |message: String| DispatchError::Enqueue {
            kernel: kernel.symbol.clone(),
            message,
        };

        let (source, symbol, buffers, scalars) = {
            let state = self.state()?;
            let k = state
                .kernels
                .get(&kernel.id)
                .ok_or_else(|| DispatchError::UnknownHandle(format!("kernel {}", kernel.symbol)))?;
            let program = state
                .programs
                .get(&k.program)
                .ok_or_else(|| DispatchError::UnknownHandle(format!("program {}", k.program)))?;
            let mut buffers = Vec::new();
            let mut scalars = Vec::new();
            for (i, arg) in k.args.iter().enumerate() {
                match arg {
                    None => return Err(reject(format!("argument {i} is not set"))),
                    Some(KernelArg::Buffer(b)) => {
                        let buffer = state
                            .buffers
                            .get(&b.id)
                            .cloned()
                            .ok_or_else(|| DispatchError::UnknownHandle(format!("buffer {}", b.id)))?;
                        buffers.push((i as u32, buffer));
                    }
                    Some(scalar) => scalars.extend(scalar.scalar_bits()),
                }
            }
            (program.source.clone(), k.symbol.clone(), buffers, scalars)
        };
        if scalars.len() > MAX_SCALAR_ARGS {
            return Err(reject(format!(
                "{} scalar arguments exceed the limit of {MAX_SCALAR_ARGS}",
                scalars.len()
            )));
        }

        let bindings: Vec<u32> = buffers.iter().map(|(b, _)| *b).collect();
        let cached = self.pipeline_for(&source, &symbol, local, &bindings)?;

        let mut words = [0u32; 8 + MAX_SCALAR_ARGS];
        for axis in 0..range.dims() {
            words[axis] = range.offset[axis];
            words[4 + axis] = range.global[axis];
        }
        for axis in range.dims()..3 {
            words[4 + axis] = 1;
        }
        words[8..8 + scalars.len()].copy_from_slice(&scalars);
        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("ktune-params"),
                contents: bytemuck::cast_slice(&words),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let mut entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: PARAMS_BINDING,
            resource: params.as_entire_binding(),
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ktune-bg"),
            layout: &cached.bind_group_layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("ktune-dispatch"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("ktune-dispatch-pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&cached.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }

        let queued_micros = elapsed_micros(self.epoch);
        let submission = self.queue.submit(Some(encoder.finish()));
        let event = Arc::new(WgpuEvent {
            submission,
            queued_micros,
            submit_micros: elapsed_micros(self.epoch),
            end_micros: AtomicI64::new(PENDING),
        });
        let done = event.clone();
        let epoch = self.epoch;
        self.queue.on_submitted_work_done(move || {
            done.end_micros.store(elapsed_micros(epoch), Ordering::Release);
        });

        let mut state = self.state()?;
        let id = state.next_id();
        state.events.insert(id, event);
        Ok(EventHandle { id })
    }

    fn wait(&self, event: EventHandle) -> Result<()> {
        let ev = self.event(event)?;
        if ev.end_micros.load(Ordering::Acquire) == PENDING {
            self.device
                .poll(wgpu::Maintain::WaitForSubmissionIndex(ev.submission.clone()));
            // The completion callback normally ran inside poll.
            let _ = ev.end_micros.compare_exchange(
                PENDING,
                elapsed_micros(self.epoch),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        Ok(())
    }

    fn call_stats(&self, event: EventHandle) -> Result<CallStats> {
        self.wait(event)?;
        let ev = self.event(event)?;
        Ok(CallStats {
            queued_micros: ev.queued_micros,
            submit_micros: ev.submit_micros,
            start_micros: ev.submit_micros,
            end_micros: ev.end_micros.load(Ordering::Acquire),
        })
    }

    fn release_event(&self, event: EventHandle) {
        if let Ok(mut state) = self.state() {
            state.events.remove(&event.id);
        }
    }

    fn create_buffer(&self, size_bytes: usize) -> Result<BufferHandle> {
        let padded = size_bytes.max(4).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT as usize);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ktune-buffer"),
            size: padded as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut state = self.state()?;
        let id = state.next_id();
        state.buffers.insert(id, Arc::new(buffer));
        Ok(BufferHandle { id, size_bytes })
    }

    fn write_buffer(&self, buffer: &BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
        if offset % align != 0 || data.len() % align != 0 {
            return Err(DispatchError::Device(format!(
                "buffer writes must be {align}-byte aligned (offset {offset}, len {})",
                data.len()
            )));
        }
        let target = self
            .state()?
            .buffers
            .get(&buffer.id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownHandle(format!("buffer {}", buffer.id)))?;
        if (offset + data.len()) as u64 > target.size() {
            return Err(DispatchError::Device(format!(
                "write of {} bytes at {offset} overflows buffer of {} bytes",
                data.len(),
                target.size()
            )));
        }
        self.queue.write_buffer(&target, offset as u64, data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &BufferHandle) -> Result<Vec<u8>> {
        let source = self
            .state()?
            .buffers
            .get(&buffer.id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownHandle(format!("buffer {}", buffer.id)))?;
        let size = source.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ktune-readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("ktune-readback"),
            });
        encoder.copy_buffer_to_buffer(&source, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        block_on(rx)
            .map_err(|_| DispatchError::Device("map_async callback dropped".to_string()))?
            .map_err(|e| DispatchError::Device(format!("buffer map failed: {e}")))?;
        let data = slice.get_mapped_range();
        let out = data[..buffer.size_bytes.min(data.len())].to_vec();
        drop(data);
        staging.unmap();
        Ok(out)
    }

    fn release_buffer(&self, buffer: &BufferHandle) {
        if let Ok(mut state) = self.state() {
            if let Some(b) = state.buffers.remove(&buffer.id) {
                b.destroy();
            }
        }
    }
}
