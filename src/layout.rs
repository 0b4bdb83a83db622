//! Strongly typed views of the arena layout and the kernels a program runs.
//!
//! Names are resolved against the metadata exactly once, when the runtime is
//! built. The per-sample hot path then works with plain offsets and task
//! lists instead of string lookups.

use serde::{Deserialize, Serialize};

use crate::errors::{RuntimeError, RuntimeResult};
use crate::metadata::{AotMetadata, FIELD_ELEMENT_BYTES, TaskInfo};

/// Byte range of one field inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSlot {
    offset: usize,
    len: usize,
}

impl FieldSlot {
    /// Resolves a named field, checking that its extent is addressable and
    /// lies inside the arena.
    pub fn resolve(metadata: &AotMetadata, name: &str) -> RuntimeResult<Self> {
        let field = metadata
            .field(name)
            .ok_or_else(|| RuntimeError::MissingField {
                name: name.to_string(),
            })?;
        let offset = field.mem_offset_in_parent;
        let arena_size = metadata.root_buffer_size;

        let len = field
            .byte_len()
            .ok_or_else(|| RuntimeError::FieldSizeOverflow {
                name: name.to_string(),
                offset,
            })?;
        match offset.checked_add(len) {
            Some(end) if end <= arena_size => Ok(Self { offset, len }),
            end => Err(RuntimeError::FieldOutsideArena {
                name: name.to_string(),
                offset,
                end: end.unwrap_or(usize::MAX),
                arena_size,
            }),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Extent of the field in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First byte past the field. Resolution guarantees this fits the arena.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Number of 4-byte elements in the field.
    pub fn num_elements(&self) -> usize {
        self.len / FIELD_ELEMENT_BYTES
    }

    fn overlaps(&self, other: &FieldSlot) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Rejects any pair of named slots that share arena bytes.
pub fn check_disjoint(named: &[(&str, FieldSlot)]) -> RuntimeResult<()> {
    for (i, (first, a)) in named.iter().enumerate() {
        for (second, b) in named.iter().skip(i + 1) {
            if a.overlaps(b) {
                return Err(RuntimeError::OverlappingFields {
                    first: first.to_string(),
                    second: second.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Names of the fields the training loop reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldNames {
    pub input: String,
    pub label: String,
    pub logits: String,
    pub loss: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            input: "x".to_string(),
            label: "label".to_string(),
            logits: "logits".to_string(),
            loss: "loss".to_string(),
        }
    }
}

/// Resolved arena slots of the training fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub input: FieldSlot,
    pub label: FieldSlot,
    pub logits: FieldSlot,
    pub loss: FieldSlot,
    input_name: String,
}

impl FieldLayout {
    /// Resolves every required field, checking that it fits inside the arena
    /// and does not overlap another required field.
    pub fn resolve(metadata: &AotMetadata, names: &FieldNames) -> RuntimeResult<Self> {
        let named = [
            (names.input.as_str(), FieldSlot::resolve(metadata, &names.input)?),
            (names.label.as_str(), FieldSlot::resolve(metadata, &names.label)?),
            (names.logits.as_str(), FieldSlot::resolve(metadata, &names.logits)?),
            (names.loss.as_str(), FieldSlot::resolve(metadata, &names.loss)?),
        ];
        check_disjoint(&named)?;

        Ok(Self {
            input: named[0].1,
            label: named[1].1,
            logits: named[2].1,
            loss: named[3].1,
            input_name: names.input.clone(),
        })
    }

    /// Name of the input field, used in diagnostics.
    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    /// Number of output classes held by the logits field.
    pub fn num_classes(&self) -> usize {
        self.logits.num_elements()
    }
}

/// Names of the four kernels the training loop requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelNames {
    pub init_params: String,
    pub forward: String,
    pub backward: String,
    pub apply_grad: String,
}

impl Default for KernelNames {
    fn default() -> Self {
        Self {
            init_params: "mnist_init_params".to_string(),
            forward: "mnist_forward".to_string(),
            backward: "mnist_backward".to_string(),
            apply_grad: "mnist_apply_grad".to_string(),
        }
    }
}

/// Role of a required kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelRole {
    InitParams,
    Forward,
    Backward,
    ApplyGrad,
}

impl KernelRole {
    fn index(self) -> usize {
        match self {
            KernelRole::InitParams => 0,
            KernelRole::Forward => 1,
            KernelRole::Backward => 2,
            KernelRole::ApplyGrad => 3,
        }
    }
}

/// A resolved kernel: its name and ordered tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedKernel {
    pub name: String,
    pub tasks: Vec<TaskInfo>,
}

impl ResolvedKernel {
    /// Looks up a kernel by name. Kernels without tasks are rejected.
    pub fn resolve(metadata: &AotMetadata, name: &str) -> RuntimeResult<Self> {
        let kernel = metadata
            .kernel(name)
            .ok_or_else(|| RuntimeError::MissingKernel {
                name: name.to_string(),
            })?;
        if kernel.tasks.is_empty() {
            return Err(RuntimeError::EmptyKernel {
                name: name.to_string(),
            });
        }
        Ok(Self {
            name: kernel.name.clone(),
            tasks: kernel.tasks.clone(),
        })
    }
}

/// The kernels and fields a runtime resolves from the metadata before it
/// loads any task.
pub trait KernelProgram {
    /// Every kernel the program dispatches, in load order.
    fn kernels(&self) -> &[ResolvedKernel];

    fn kernel(&self, name: &str) -> Option<&ResolvedKernel> {
        self.kernels().iter().find(|kernel| kernel.name == name)
    }

    /// Every task of every kernel, in kernel then task order.
    fn tasks(&self) -> impl Iterator<Item = &TaskInfo> {
        self.kernels().iter().flat_map(|kernel| kernel.tasks.iter())
    }
}

/// The four training kernels, resolved from the metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelTable {
    kernels: [ResolvedKernel; 4],
}

impl KernelTable {
    pub fn resolve(metadata: &AotMetadata, names: &KernelNames) -> RuntimeResult<Self> {
        Ok(Self {
            kernels: [
                ResolvedKernel::resolve(metadata, &names.init_params)?,
                ResolvedKernel::resolve(metadata, &names.forward)?,
                ResolvedKernel::resolve(metadata, &names.backward)?,
                ResolvedKernel::resolve(metadata, &names.apply_grad)?,
            ],
        })
    }

    pub fn get(&self, role: KernelRole) -> &ResolvedKernel {
        &self.kernels[role.index()]
    }
}

impl KernelProgram for KernelTable {
    fn kernels(&self) -> &[ResolvedKernel] {
        &self.kernels
    }
}

/// The MNIST training program: its fields and its four kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct MnistProgram {
    pub fields: FieldLayout,
    pub kernels: KernelTable,
}

impl MnistProgram {
    pub fn resolve(
        metadata: &AotMetadata,
        kernel_names: &KernelNames,
        field_names: &FieldNames,
    ) -> RuntimeResult<Self> {
        Ok(Self {
            fields: FieldLayout::resolve(metadata, field_names)?,
            kernels: KernelTable::resolve(metadata, kernel_names)?,
        })
    }
}

impl KernelProgram for MnistProgram {
    fn kernels(&self) -> &[ResolvedKernel] {
        self.kernels.kernels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FieldInfo, KernelInfo};

    fn field(name: &str, offset: usize, shape: Vec<usize>) -> FieldInfo {
        FieldInfo {
            field_name: name.to_string(),
            mem_offset_in_parent: offset,
            shape,
            element_shape: vec![],
        }
    }

    fn metadata(fields: Vec<FieldInfo>, root_buffer_size: usize) -> AotMetadata {
        AotMetadata {
            fields,
            kernels: vec![],
            root_buffer_size,
        }
    }

    #[test]
    fn test_resolve_layout() {
        let info = metadata(
            vec![
                field("x", 0, vec![4]),
                field("label", 16, vec![]),
                field("logits", 20, vec![10]),
                field("loss", 60, vec![]),
            ],
            64,
        );
        let layout = FieldLayout::resolve(&info, &FieldNames::default()).unwrap();
        assert_eq!(layout.input.offset(), 0);
        assert_eq!(layout.input.len(), 16);
        assert_eq!(layout.label.len(), 4);
        assert_eq!(layout.num_classes(), 10);
        assert_eq!(layout.loss.end(), 64);
        assert_eq!(layout.input_name(), "x");
    }

    #[test]
    fn test_missing_field() {
        let info = metadata(vec![field("x", 0, vec![4])], 64);
        let result = FieldLayout::resolve(&info, &FieldNames::default());
        assert!(matches!(
            result,
            Err(RuntimeError::MissingField { name }) if name == "label"
        ));
    }

    #[test]
    fn test_field_outside_arena() {
        let info = metadata(
            vec![
                field("x", 0, vec![4]),
                field("label", 16, vec![]),
                field("logits", 20, vec![10]),
                field("loss", 60, vec![]),
            ],
            62,
        );
        let result = FieldLayout::resolve(&info, &FieldNames::default());
        assert!(matches!(
            result,
            Err(RuntimeError::FieldOutsideArena { name, end: 64, .. }) if name == "loss"
        ));
    }

    #[test]
    fn test_field_end_overflow_is_rejected() {
        let info = metadata(vec![field("x", usize::MAX, vec![4])], 64);
        let result = FieldSlot::resolve(&info, "x");
        assert!(matches!(
            result,
            Err(RuntimeError::FieldOutsideArena { offset: usize::MAX, end: usize::MAX, .. })
        ));
    }

    #[test]
    fn test_field_shape_overflow_is_rejected() {
        let info = metadata(
            vec![
                field("x", 0, vec![4294967296, 4294967296]),
                field("label", 16, vec![]),
                field("logits", 20, vec![10]),
                field("loss", 60, vec![]),
            ],
            64,
        );
        let result = FieldLayout::resolve(&info, &FieldNames::default());
        assert!(matches!(
            result,
            Err(RuntimeError::FieldSizeOverflow { name, offset: 0 }) if name == "x"
        ));
    }

    #[test]
    fn test_overlapping_fields() {
        let info = metadata(
            vec![
                field("x", 0, vec![4]),
                field("label", 12, vec![]),
                field("logits", 20, vec![10]),
                field("loss", 60, vec![]),
            ],
            64,
        );
        let result = FieldLayout::resolve(&info, &FieldNames::default());
        assert!(matches!(result, Err(RuntimeError::OverlappingFields { .. })));
    }

    #[test]
    fn test_kernel_table_roles() {
        let task = |name: &str| TaskInfo {
            name: name.to_string(),
            advisory_total_num_threads: 1,
            advisory_num_threads_per_group: 1,
            buffer_binds: vec![],
        };
        let names = KernelNames::default();
        let info = AotMetadata {
            fields: vec![],
            kernels: vec![
                KernelInfo {
                    name: names.forward.clone(),
                    tasks: vec![task("f0"), task("f1")],
                },
                KernelInfo {
                    name: names.init_params.clone(),
                    tasks: vec![task("i0")],
                },
                KernelInfo {
                    name: names.backward.clone(),
                    tasks: vec![task("b0")],
                },
                KernelInfo {
                    name: names.apply_grad.clone(),
                    tasks: vec![task("a0")],
                },
            ],
            root_buffer_size: 0,
        };

        let table = KernelTable::resolve(&info, &names).unwrap();
        assert_eq!(table.get(KernelRole::Forward).tasks.len(), 2);
        assert_eq!(table.kernel("mnist_backward"), Some(table.get(KernelRole::Backward)));
        assert_eq!(table.kernel("unknown"), None);

        let order: Vec<_> = table.tasks().map(|t| t.name.as_str()).collect();
        assert_eq!(order, vec!["i0", "f0", "f1", "b0", "a0"]);
    }

    #[test]
    fn test_empty_kernel_rejected() {
        let names = KernelNames::default();
        let info = AotMetadata {
            fields: vec![],
            kernels: vec![KernelInfo {
                name: names.init_params.clone(),
                tasks: vec![],
            }],
            root_buffer_size: 0,
        };
        let result = KernelTable::resolve(&info, &names);
        assert!(matches!(result, Err(RuntimeError::EmptyKernel { .. })));
    }
}
