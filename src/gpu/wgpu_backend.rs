//! wgpu implementation of [`ComputeBackend`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;

use log::{debug, info};
use pollster::FutureExt;

use super::context::GpuContext;
use super::errors::{GpuError, GpuResult};
use super::shader_library::{SHADER_ENTRY_POINT, ShaderLibrary};
use crate::backend::{ComputeBackend, ScalarArgs, TaskLaunch, check_arena_range, check_buffer_binds};
use crate::errors::{RuntimeError, RuntimeResult};
use crate::metadata::{BufferBind, BufferKind, TaskInfo};

/// Size of the global temporaries buffer handed to tasks that bind one.
pub const GLOBAL_TMPS_BYTES: u64 = 1 << 20;

/// A task's compiled pipeline together with the bindings it expects.
struct TaskPipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    binds: Vec<BufferBind>,
}

/// Runs exported SPIR-V tasks on the GPU against a device-resident arena.
pub struct WgpuBackend {
    context: GpuContext,
    library: ShaderLibrary,
    pipelines: HashMap<String, TaskPipeline>,
    arena: Option<wgpu::Buffer>,
    arena_size: usize,
    global_tmps: Option<wgpu::Buffer>,
    needs_global_tmps: bool,
    args_buffers: Vec<wgpu::Buffer>,
}

impl WgpuBackend {
    /// Acquires a GPU device and prepares to load task libraries from
    /// `shader_dir`.
    pub fn new(shader_dir: impl Into<PathBuf>) -> GpuResult<Self> {
        let context = GpuContext::request()?;
        Ok(Self::with_context(context, ShaderLibrary::new(shader_dir)))
    }

    /// Builds a backend on an existing device.
    pub fn with_context(context: GpuContext, library: ShaderLibrary) -> Self {
        Self {
            context,
            library,
            pipelines: HashMap::new(),
            arena: None,
            arena_size: 0,
            global_tmps: None,
            needs_global_tmps: false,
            args_buffers: Vec::new(),
        }
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.context.adapter_info
    }

    fn create_storage_buffer(&self, label: &str, size: u64, usage: wgpu::BufferUsages) -> wgpu::Buffer {
        self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE | usage,
            mapped_at_creation: false,
        })
    }

    fn ensure_args_buffers(&mut self, count: usize) {
        while self.args_buffers.len() < count {
            let buffer = self.create_storage_buffer(
                "scalar args",
                ScalarArgs::SIZE_BYTES as u64,
                wgpu::BufferUsages::COPY_DST,
            );
            self.args_buffers.push(buffer);
        }
    }

    fn compile(&self, task: &TaskInfo, words: Vec<u32>) -> GpuResult<TaskPipeline> {
        let device = &self.context.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(task.name.as_str()),
            source: wgpu::ShaderSource::SpirV(words.into()),
        });

        let entries: Vec<wgpu::BindGroupLayoutEntry> = task
            .buffer_binds
            .iter()
            .map(|bind| wgpu::BindGroupLayoutEntry {
                binding: bind.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(task.name.as_str()),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(task.name.as_str()),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(task.name.as_str()),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(SHADER_ENTRY_POINT),
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(err) = device.pop_error_scope().block_on() {
            return Err(GpuError::ShaderCompilationFailed {
                task: task.name.clone(),
                message: err.to_string(),
            });
        }

        Ok(TaskPipeline {
            pipeline,
            bind_group_layout,
            binds: task.buffer_binds.clone(),
        })
    }

    /// Records one compute pass per launch. Must run inside a validation
    /// error scope.
    fn encode(&self, launches: &[TaskLaunch<'_>]) -> RuntimeResult<wgpu::CommandBuffer> {
        let arena = self.arena.as_ref().ok_or(RuntimeError::ArenaNotAllocated)?;
        let device = &self.context.device;
        let max_groups = device.limits().max_compute_workgroups_per_dimension;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("kernel dispatch"),
        });

        for (launch, args) in launches.iter().zip(&self.args_buffers) {
            let task = launch.task;
            let compiled = self
                .pipelines
                .get(&task.name)
                .ok_or_else(|| RuntimeError::TaskNotLoaded {
                    task: task.name.clone(),
                })?;

            if task.needs_args() {
                let record = ScalarArgs::new(launch.scalar.unwrap_or(0.0));
                self.context
                    .queue
                    .write_buffer(args, 0, bytemuck::bytes_of(&record));
            }

            let mut entries = Vec::with_capacity(compiled.binds.len());
            for bind in &compiled.binds {
                let buffer = match bind.buffer.kind {
                    BufferKind::Root => arena,
                    BufferKind::Args => args,
                    BufferKind::GlobalTmps => self.global_tmps.as_ref().ok_or_else(|| {
                        GpuError::BufferCreationFailed {
                            message: "global temporaries buffer was not allocated".to_string(),
                        }
                    })?,
                    BufferKind::Other(kind) => {
                        return Err(RuntimeError::UnsupportedBufferBinding {
                            task: task.name.clone(),
                            kind,
                        });
                    }
                };
                entries.push(wgpu::BindGroupEntry {
                    binding: bind.binding,
                    resource: buffer.as_entire_binding(),
                });
            }

            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(task.name.as_str()),
                layout: &compiled.bind_group_layout,
                entries: &entries,
            });

            let groups = launch.clamped_group_count(max_groups);
            debug!(
                "dispatch {} ({} threads, width {}, {} groups)",
                task.name, launch.total_threads, launch.group_width, groups
            );
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(task.name.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&compiled.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups, 1, 1);
        }

        Ok(encoder.finish())
    }
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn max_threads_per_group(&self) -> u32 {
        self.context.device.limits().max_compute_invocations_per_workgroup
    }

    fn load_task(&mut self, task: &TaskInfo) -> RuntimeResult<()> {
        check_buffer_binds(task)?;
        let words = self.library.load(&task.name)?;
        let pipeline = self.compile(task, words)?;
        self.needs_global_tmps |= task.needs_global_tmps();
        debug!("loaded task library {}", self.library.path_for(&task.name).display());
        self.pipelines.insert(task.name.clone(), pipeline);
        Ok(())
    }

    fn allocate_arena(&mut self, size: usize) -> RuntimeResult<()> {
        let limits = self.context.device.limits();
        let max = (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
        let size = size.checked_next_multiple_of(4).unwrap_or(usize::MAX).max(4);
        if size as u64 > max {
            return Err(GpuError::BufferCreationFailed {
                message: format!("arena of {size} bytes exceeds the device limit of {max} bytes"),
            }
            .into());
        }

        self.context
            .device
            .push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let arena = self.create_storage_buffer(
            "arena",
            size as u64,
            wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
        );
        let global_tmps = self.needs_global_tmps.then(|| {
            self.create_storage_buffer("global tmps", GLOBAL_TMPS_BYTES, wgpu::BufferUsages::empty())
        });
        if let Some(err) = self.context.device.pop_error_scope().block_on() {
            return Err(GpuError::BufferCreationFailed {
                message: err.to_string(),
            }
            .into());
        }

        info!("allocated {size} byte arena on {}", self.context.adapter_info.name);
        self.arena = Some(arena);
        self.arena_size = size;
        self.global_tmps = global_tmps;
        Ok(())
    }

    fn write_arena(&mut self, offset: usize, bytes: &[u8]) -> RuntimeResult<()> {
        let arena = self.arena.as_ref().ok_or(RuntimeError::ArenaNotAllocated)?;
        check_arena_range(offset, bytes.len(), self.arena_size)?;
        if !bytes.is_empty() {
            self.context.queue.write_buffer(arena, offset as u64, bytes);
        }
        Ok(())
    }

    fn read_arena(&mut self, offset: usize, len: usize) -> RuntimeResult<Vec<u8>> {
        let arena = self.arena.as_ref().ok_or(RuntimeError::ArenaNotAllocated)?;
        check_arena_range(offset, len, self.arena_size)?;
        if len == 0 {
            return Ok(Vec::new());
        }

        let device = &self.context.device;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("arena readback"),
            size: len as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("arena readback"),
        });
        encoder.copy_buffer_to_buffer(arena, offset as u64, &staging, 0, len as u64);
        self.context.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(|err| GpuError::BufferMapFailed {
                message: err.to_string(),
            })?
            .map_err(|err| GpuError::BufferMapFailed {
                message: err.to_string(),
            })?;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    fn submit(&mut self, launches: &[TaskLaunch<'_>]) -> RuntimeResult<()> {
        self.ensure_args_buffers(launches.len());
        let device = &self.context.device;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let submitted = self.encode(launches).map(|commands| {
            self.context.queue.submit(Some(commands));
        });
        let validation = device.pop_error_scope().block_on();
        submitted?;
        let _ = device.poll(wgpu::Maintain::Wait);

        if let Some(err) = validation {
            let tasks: Vec<&str> = launches.iter().map(|l| l.task.name.as_str()).collect();
            return Err(RuntimeError::DispatchFailed {
                task: tasks.join(", "),
                message: err.to_string(),
            });
        }
        Ok(())
    }
}
