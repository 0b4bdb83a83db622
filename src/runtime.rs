//! The kernel runtime: owns the backend, the arena and the resolved program.
//!
//! Construction is all or nothing. The program's fields and kernels are
//! resolved first, then every task library is loaded, then the arena is
//! allocated. Any failure drops the backend and nothing usable is left
//! behind. The MNIST training program is the default; other programs, such
//! as the gradient check in [`crate::autodiff`], reuse the same dispatch path.

use log::{debug, info};

use crate::backend::{ComputeBackend, TaskLaunch};
use crate::errors::{RuntimeError, RuntimeResult};
use crate::layout::{
    FieldLayout, FieldNames, FieldSlot, KernelNames, KernelProgram, KernelRole, KernelTable,
    MnistProgram, ResolvedKernel,
};
use crate::metadata::{AotMetadata, FIELD_ELEMENT_BYTES, TaskInfo};

/// Threads per group for `task`: the advisory width clamped to the device
/// maximum. An advisory of zero selects the maximum.
pub fn launch_width(task: &TaskInfo, max_threads_per_group: u32) -> u32 {
    let max = max_threads_per_group.max(1);
    match task.advisory_num_threads_per_group {
        0 => max,
        advisory => advisory.min(max),
    }
}

/// Launch plan for `steps`: every task of each kernel, in order, each with
/// its kernel's scalar argument.
fn plan_launches<'a>(
    steps: &[(&'a ResolvedKernel, Option<f32>)],
    max_threads_per_group: u32,
) -> Vec<TaskLaunch<'a>> {
    steps
        .iter()
        .flat_map(|&(kernel, scalar)| {
            kernel.tasks.iter().map(move |task| TaskLaunch {
                task,
                group_width: launch_width(task, max_threads_per_group),
                total_threads: task.total_threads(),
                scalar,
            })
        })
        .collect()
}

pub struct KernelRuntime<B: ComputeBackend, P: KernelProgram = MnistProgram> {
    metadata: AotMetadata,
    program: P,
    backend: B,
    max_threads_per_group: u32,
}

impl<B: ComputeBackend, P: KernelProgram> KernelRuntime<B, P> {
    /// Loads every task of an already resolved program and allocates the
    /// arena.
    pub fn from_program(metadata: AotMetadata, mut backend: B, program: P) -> RuntimeResult<Self> {
        for task in program.tasks() {
            backend.load_task(task)?;
        }
        backend.allocate_arena(metadata.root_buffer_size)?;

        let max_threads_per_group = backend.max_threads_per_group();
        info!(
            "{} runtime ready: {} kernels, {} tasks, {} byte arena",
            backend.name(),
            program.kernels().len(),
            program.tasks().count(),
            metadata.root_buffer_size
        );

        Ok(Self {
            metadata,
            program,
            backend,
            max_threads_per_group,
        })
    }

    pub fn metadata(&self) -> &AotMetadata {
        &self.metadata
    }

    pub fn program(&self) -> &P {
        &self.program
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn arena_size(&self) -> usize {
        self.metadata.root_buffer_size
    }

    /// Runs every task of the named kernel, in order, and waits for them.
    pub fn dispatch(&mut self, kernel_name: &str, scalar: Option<f32>) -> RuntimeResult<()> {
        let kernel = self
            .program
            .kernel(kernel_name)
            .ok_or_else(|| RuntimeError::MissingKernel {
                name: kernel_name.to_string(),
            })?;
        let launches = plan_launches(&[(kernel, scalar)], self.max_threads_per_group);
        debug!("submitting {} launches for {}", launches.len(), kernel_name);
        self.backend.submit(&launches)
    }

    /// Writes `bytes` at the start of `slot`. Writing past the slot's extent
    /// is rejected.
    pub fn write_field(&mut self, slot: FieldSlot, bytes: &[u8]) -> RuntimeResult<()> {
        if bytes.len() > slot.len() {
            return Err(RuntimeError::FieldOverflow {
                offset: slot.offset(),
                capacity: slot.len(),
                actual: bytes.len(),
            });
        }
        self.backend.write_arena(slot.offset(), bytes)
    }

    pub fn read_field(&mut self, slot: FieldSlot) -> RuntimeResult<Vec<u8>> {
        self.backend.read_arena(slot.offset(), slot.len())
    }

    pub fn read_f32s(&mut self, slot: FieldSlot) -> RuntimeResult<Vec<f32>> {
        Ok(decode_f32(&self.read_field(slot)?))
    }
}

impl<B: ComputeBackend> KernelRuntime<B> {
    pub fn new(
        metadata: AotMetadata,
        backend: B,
        kernel_names: &KernelNames,
        field_names: &FieldNames,
    ) -> RuntimeResult<Self> {
        let program = MnistProgram::resolve(&metadata, kernel_names, field_names)?;
        let classes = program.fields.num_classes();
        let runtime = Self::from_program(metadata, backend, program)?;
        info!("training program has {} classes", classes);
        Ok(runtime)
    }

    /// Builds a runtime using the default kernel and field names.
    pub fn with_defaults(metadata: AotMetadata, backend: B) -> RuntimeResult<Self> {
        Self::new(
            metadata,
            backend,
            &KernelNames::default(),
            &FieldNames::default(),
        )
    }

    pub fn layout(&self) -> &FieldLayout {
        &self.program.fields
    }

    pub fn kernels(&self) -> &KernelTable {
        &self.program.kernels
    }

    pub fn num_classes(&self) -> usize {
        self.program.fields.num_classes()
    }

    /// Number of input elements per sample.
    pub fn image_size(&self) -> usize {
        self.program.fields.input.num_elements()
    }

    pub fn dispatch_role(&mut self, role: KernelRole, scalar: Option<f32>) -> RuntimeResult<()> {
        self.dispatch_sequence(&[(role, scalar)])
    }

    /// Submits several kernels as one unit of work with a single completion
    /// wait. Each kernel receives its own scalar argument.
    pub fn dispatch_sequence(&mut self, steps: &[(KernelRole, Option<f32>)]) -> RuntimeResult<()> {
        let kernels: Vec<_> = steps
            .iter()
            .map(|&(role, scalar)| (self.program.kernels.get(role), scalar))
            .collect();
        let launches = plan_launches(&kernels, self.max_threads_per_group);

        debug!("submitting {} launches for {:?}", launches.len(), steps);
        self.backend.submit(&launches)
    }

    /// Runs the parameter-init kernel. `base` is passed as its scalar
    /// argument; the kernel falls back to its built-in scale when absent.
    pub fn initialize_parameters(&mut self, base: Option<f32>) -> RuntimeResult<()> {
        self.dispatch_role(KernelRole::InitParams, base)
    }

    /// Copies one sample into the input and label fields.
    pub fn write_sample(&mut self, image: &[f32], label: u8) -> RuntimeResult<()> {
        if image.len() != self.image_size() {
            return Err(RuntimeError::ImageSizeMismatch {
                field: self.layout().input_name().to_string(),
                dataset: image.len(),
                field_elements: self.image_size(),
            });
        }
        let (input, label_slot) = (self.layout().input, self.layout().label);
        self.write_field(input, bytemuck::cast_slice(image))?;
        self.write_field(label_slot, &i32::from(label).to_le_bytes())
    }

    pub fn read_loss(&mut self) -> RuntimeResult<f32> {
        let loss = self.read_f32s(self.layout().loss)?;
        Ok(loss.first().copied().unwrap_or_default())
    }

    pub fn read_logits(&mut self) -> RuntimeResult<Vec<f32>> {
        self.read_f32s(self.layout().logits)
    }
}

/// Decodes little-endian `f32` values; trailing bytes are ignored.
pub fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(FIELD_ELEMENT_BYTES)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
