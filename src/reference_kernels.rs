//! CPU implementations of the exported kernels.
//!
//! [`ReferenceModel`] lays the MNIST logistic-regression fields out back to
//! back, produces the matching metadata (with the same task split the
//! exporter emits) and a [`HostBackend`] whose closures compute exactly what
//! the device kernels compute. This lets the full training pipeline run
//! without a GPU. [`AutodiffReference`] does the same for the autodiff
//! kernels the gradient check drives.

use crate::autodiff::{AutodiffNames, initial_value};
use crate::backend::{HostBackend, HostInvocation};
use crate::errors::RuntimeResult;
use crate::layout::KernelNames;
use crate::metadata::{
    AotMetadata, BufferBind, BufferKind, FIELD_ELEMENT_BYTES, FieldInfo, KernelInfo, TaskInfo,
};

pub const NUM_CLASSES: usize = 10;
pub const NUM_FEATURES: usize = 784;

/// Weight scale applied by parameter init when no base value is passed.
pub const DEFAULT_WEIGHT_SCALE: f32 = 0.0002;

const THREADS_PER_GROUP: u32 = 128;

/// Deterministic initial weight pattern of the exported init kernel.
pub fn initial_weight(class: usize, feature: usize, scale: f32) -> f32 {
    let v = ((class * 131 + feature * 17) % 97) as f32 - 48.0;
    v * scale
}

/// Byte offsets of every model field inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceModel {
    pub image_size: usize,
    pub num_classes: usize,
    x: usize,
    label: usize,
    w: usize,
    b: usize,
    logits: usize,
    grad_w: usize,
    grad_b: usize,
    loss: usize,
    arena_size: usize,
}

impl ReferenceModel {
    pub fn new(image_size: usize, num_classes: usize) -> Self {
        let weights = image_size * num_classes * FIELD_ELEMENT_BYTES;
        let classes = num_classes * FIELD_ELEMENT_BYTES;

        let x = 0;
        let label = x + image_size * FIELD_ELEMENT_BYTES;
        let w = label + FIELD_ELEMENT_BYTES;
        let b = w + weights;
        let logits = b + classes;
        let grad_w = logits + classes;
        let grad_b = grad_w + weights;
        let loss = grad_b + classes;
        let arena_size = loss + FIELD_ELEMENT_BYTES;

        Self {
            image_size,
            num_classes,
            x,
            label,
            w,
            b,
            logits,
            grad_w,
            grad_b,
            loss,
            arena_size,
        }
    }

    /// The 784-feature, 10-class model the exporter builds.
    pub fn mnist() -> Self {
        Self::new(NUM_FEATURES, NUM_CLASSES)
    }

    fn fields(&self) -> Vec<FieldInfo> {
        let (n, c) = (self.image_size, self.num_classes);
        let field = |name: &str, offset: usize, shape: Vec<usize>| FieldInfo {
            field_name: name.to_string(),
            mem_offset_in_parent: offset,
            shape,
            element_shape: vec![],
        };
        vec![
            field("x", self.x, vec![n]),
            field("label", self.label, vec![]),
            field("w", self.w, vec![c, n]),
            field("b", self.b, vec![c]),
            field("logits", self.logits, vec![c]),
            field("grad_w", self.grad_w, vec![c, n]),
            field("grad_b", self.grad_b, vec![c]),
            field("loss", self.loss, vec![]),
        ]
    }

    /// Task layout of every kernel: `(kernel, [(threads, binds args)])`.
    fn task_plan(&self, names: &KernelNames) -> Vec<(String, Vec<(usize, bool)>)> {
        let (n, c) = (self.image_size, self.num_classes);
        vec![
            (names.init_params.clone(), vec![(c * n, true), (c, false)]),
            (names.forward.clone(), vec![(1, false), (c, false)]),
            (names.backward.clone(), vec![(c, false)]),
            (names.apply_grad.clone(), vec![(c * n, true), (c, true)]),
        ]
    }

    /// Metadata describing this layout and the four kernels under `names`.
    pub fn metadata_with(&self, names: &KernelNames) -> AotMetadata {
        let kernels = self
            .task_plan(names)
            .into_iter()
            .map(|(kernel, tasks)| {
                let tasks = tasks
                    .into_iter()
                    .enumerate()
                    .map(|(i, (threads, args))| {
                        let mut buffer_binds = vec![BufferBind::new(0, BufferKind::Root)];
                        if args {
                            buffer_binds.push(BufferBind::new(1, BufferKind::Args));
                        }
                        TaskInfo {
                            name: task_name(&kernel, i),
                            advisory_total_num_threads: threads as i64,
                            advisory_num_threads_per_group: THREADS_PER_GROUP,
                            buffer_binds,
                        }
                    })
                    .collect();
                KernelInfo {
                    name: kernel,
                    tasks,
                }
            })
            .collect();

        AotMetadata {
            fields: self.fields(),
            kernels,
            root_buffer_size: self.arena_size,
        }
    }

    pub fn metadata(&self) -> AotMetadata {
        self.metadata_with(&KernelNames::default())
    }

    /// Host backend implementing every task of [`Self::metadata_with`].
    pub fn backend_with(&self, names: &KernelNames) -> HostBackend {
        let m = *self;
        let mut backend = HostBackend::new();

        backend.register(task_name(&names.init_params, 0), move |inv| m.init_weights(inv));
        backend.register(task_name(&names.init_params, 1), move |inv| m.init_bias(inv));
        backend.register(task_name(&names.forward, 0), move |inv| m.clear_loss(inv));
        backend.register(task_name(&names.forward, 1), move |inv| m.forward(inv));
        backend.register(task_name(&names.backward, 0), move |inv| m.backward(inv));
        backend.register(task_name(&names.apply_grad, 0), move |inv| m.apply_weights(inv));
        backend.register(task_name(&names.apply_grad, 1), move |inv| m.apply_bias(inv));
        backend
    }

    pub fn backend(&self) -> HostBackend {
        self.backend_with(&KernelNames::default())
    }

    fn at(base: usize, index: usize) -> usize {
        base + index * FIELD_ELEMENT_BYTES
    }

    fn init_weights(&self, inv: &mut HostInvocation<'_>) -> RuntimeResult<()> {
        let scale = inv.scalar.unwrap_or(DEFAULT_WEIGHT_SCALE);
        for c in 0..self.num_classes {
            for j in 0..self.image_size {
                let offset = Self::at(self.w, c * self.image_size + j);
                inv.store_f32(offset, initial_weight(c, j, scale))?;
            }
        }
        Ok(())
    }

    fn init_bias(&self, inv: &mut HostInvocation<'_>) -> RuntimeResult<()> {
        for c in 0..self.num_classes {
            inv.store_f32(Self::at(self.b, c), 0.0)?;
        }
        Ok(())
    }

    fn clear_loss(&self, inv: &mut HostInvocation<'_>) -> RuntimeResult<()> {
        inv.store_f32(self.loss, 0.0)
    }

    fn target(&self, inv: &HostInvocation<'_>, class: usize) -> RuntimeResult<f32> {
        let label = inv.load_i32(self.label)?;
        Ok(if label == class as i32 { 1.0 } else { 0.0 })
    }

    fn forward(&self, inv: &mut HostInvocation<'_>) -> RuntimeResult<()> {
        let mut loss = inv.load_f32(self.loss)?;
        for c in 0..self.num_classes {
            let mut acc = inv.load_f32(Self::at(self.b, c))?;
            for j in 0..self.image_size {
                let w = inv.load_f32(Self::at(self.w, c * self.image_size + j))?;
                acc += w * inv.load_f32(Self::at(self.x, j))?;
            }
            inv.store_f32(Self::at(self.logits, c), acc)?;
            let diff = acc - self.target(inv, c)?;
            loss += 0.5 * diff * diff;
        }
        inv.store_f32(self.loss, loss)
    }

    fn backward(&self, inv: &mut HostInvocation<'_>) -> RuntimeResult<()> {
        for c in 0..self.num_classes {
            let g = inv.load_f32(Self::at(self.logits, c))? - self.target(inv, c)?;
            inv.store_f32(Self::at(self.grad_b, c), g)?;
            for j in 0..self.image_size {
                let x = inv.load_f32(Self::at(self.x, j))?;
                inv.store_f32(Self::at(self.grad_w, c * self.image_size + j), g * x)?;
            }
        }
        Ok(())
    }

    fn apply_weights(&self, inv: &mut HostInvocation<'_>) -> RuntimeResult<()> {
        let lr = inv.scalar_or_zero();
        for i in 0..self.num_classes * self.image_size {
            let w = inv.load_f32(Self::at(self.w, i))?;
            let g = inv.load_f32(Self::at(self.grad_w, i))?;
            inv.store_f32(Self::at(self.w, i), w - lr * g)?;
        }
        Ok(())
    }

    fn apply_bias(&self, inv: &mut HostInvocation<'_>) -> RuntimeResult<()> {
        let lr = inv.scalar_or_zero();
        for c in 0..self.num_classes {
            let b = inv.load_f32(Self::at(self.b, c))?;
            let g = inv.load_f32(Self::at(self.grad_b, c))?;
            inv.store_f32(Self::at(self.b, c), b - lr * g)?;
        }
        Ok(())
    }
}

/// Fields `x`, `x_grad`, `loss` and `loss_grad` of the autodiff export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutodiffReference {
    pub size: usize,
    x: usize,
    x_grad: usize,
    loss: usize,
    loss_grad: usize,
    arena_size: usize,
}

impl AutodiffReference {
    pub fn new(size: usize) -> Self {
        let x = 0;
        let x_grad = x + size * FIELD_ELEMENT_BYTES;
        let loss = x_grad + size * FIELD_ELEMENT_BYTES;
        let loss_grad = loss + FIELD_ELEMENT_BYTES;
        Self {
            size,
            x,
            x_grad,
            loss,
            loss_grad,
            arena_size: loss_grad + FIELD_ELEMENT_BYTES,
        }
    }

    /// Metadata with one task per kernel; only `init` binds arguments.
    pub fn metadata_with(&self, names: &AutodiffNames) -> AotMetadata {
        let field = |name: &str, offset: usize, shape: Vec<usize>| FieldInfo {
            field_name: name.to_string(),
            mem_offset_in_parent: offset,
            shape,
            element_shape: vec![],
        };
        let kernel = |name: &str, threads: usize, args: bool| {
            let mut buffer_binds = vec![BufferBind::new(0, BufferKind::Root)];
            if args {
                buffer_binds.push(BufferBind::new(1, BufferKind::Args));
            }
            KernelInfo {
                name: name.to_string(),
                tasks: vec![TaskInfo {
                    name: task_name(name, 0),
                    advisory_total_num_threads: threads as i64,
                    advisory_num_threads_per_group: THREADS_PER_GROUP,
                    buffer_binds,
                }],
            }
        };

        AotMetadata {
            fields: vec![
                field(&names.x, self.x, vec![self.size]),
                field(&names.x_grad, self.x_grad, vec![self.size]),
                field(&names.loss, self.loss, vec![]),
                field(&names.loss_grad, self.loss_grad, vec![]),
            ],
            kernels: vec![
                kernel(&names.init, self.size, true),
                kernel(&names.clear_loss, 1, false),
                kernel(&names.forward, self.size, false),
                kernel(&names.backward, self.size, false),
            ],
            root_buffer_size: self.arena_size,
        }
    }

    pub fn metadata(&self) -> AotMetadata {
        self.metadata_with(&AutodiffNames::default())
    }

    /// Host backend implementing every task of [`Self::metadata_with`].
    pub fn backend_with(&self, names: &AutodiffNames) -> HostBackend {
        let m = *self;
        HostBackend::new()
            .with_task(task_name(&names.init, 0), move |inv| m.init_x(inv))
            .with_task(task_name(&names.clear_loss, 0), move |inv| {
                inv.store_f32(m.loss, 0.0)
            })
            .with_task(task_name(&names.forward, 0), move |inv| m.forward(inv))
            .with_task(task_name(&names.backward, 0), move |inv| m.backward(inv))
    }

    pub fn backend(&self) -> HostBackend {
        self.backend_with(&AutodiffNames::default())
    }

    fn at(base: usize, index: usize) -> usize {
        base + index * FIELD_ELEMENT_BYTES
    }

    fn init_x(&self, inv: &mut HostInvocation<'_>) -> RuntimeResult<()> {
        let base = inv.scalar_or_zero();
        for i in 0..self.size {
            inv.store_f32(Self::at(self.x, i), initial_value(base, i))?;
        }
        Ok(())
    }

    fn forward(&self, inv: &mut HostInvocation<'_>) -> RuntimeResult<()> {
        let mut loss = inv.load_f32(self.loss)?;
        for i in 0..self.size {
            let x = inv.load_f32(Self::at(self.x, i))?;
            loss += x * x;
        }
        inv.store_f32(self.loss, loss)
    }

    fn backward(&self, inv: &mut HostInvocation<'_>) -> RuntimeResult<()> {
        let seed = inv.load_f32(self.loss_grad)?;
        for i in 0..self.size {
            let x = inv.load_f32(Self::at(self.x, i))?;
            let grad = inv.load_f32(Self::at(self.x_grad, i))?;
            inv.store_f32(Self::at(self.x_grad, i), grad + 2.0 * x * seed)?;
        }
        Ok(())
    }
}

/// Name of the `index`-th task of `kernel`.
pub fn task_name(kernel: &str, index: usize) -> String {
    format!("{kernel}_t{index:02}")
}
