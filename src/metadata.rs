//! Data structures for compiler-exported kernel metadata.
//!
//! The exporter writes a `metadata.json` next to the shader binaries. It
//! describes where every named field lives inside the single root buffer
//! (the arena), which tasks make up each kernel, and which buffers each
//! task binds. Unknown keys are ignored so newer exporter versions still load.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::errors::{RuntimeError, RuntimeResult};

/// Size in bytes of a single field element (`f32` or `i32`).
pub const FIELD_ELEMENT_BYTES: usize = 4;

/// Kind of buffer a task binds, as encoded by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum BufferKind {
    /// The root buffer holding every field (the arena).
    Root,
    /// Scratch space for global temporaries.
    GlobalTmps,
    /// Scalar kernel arguments.
    Args,
    /// Any other buffer kind; not supported by the runtime.
    Other(u32),
}

impl From<u32> for BufferKind {
    fn from(value: u32) -> Self {
        match value {
            0 => BufferKind::Root,
            1 => BufferKind::GlobalTmps,
            2 => BufferKind::Args,
            other => BufferKind::Other(other),
        }
    }
}

impl From<BufferKind> for u32 {
    fn from(kind: BufferKind) -> Self {
        match kind {
            BufferKind::Root => 0,
            BufferKind::GlobalTmps => 1,
            BufferKind::Args => 2,
            BufferKind::Other(other) => other,
        }
    }
}

/// Root identifier of a bound buffer. Older exporters write a plain integer,
/// newer ones a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RootId {
    Single(i64),
    Path(Vec<i64>),
}

impl Default for RootId {
    fn default() -> Self {
        RootId::Single(0)
    }
}

impl RootId {
    /// Returns true when the id refers to the first (and only supported) root.
    pub fn is_primary(&self) -> bool {
        match self {
            RootId::Single(id) => *id <= 0,
            RootId::Path(path) => path.iter().all(|id| *id <= 0),
        }
    }
}

/// Buffer referenced by a binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRef {
    #[serde(rename = "type")]
    pub kind: BufferKind,
    #[serde(default)]
    pub root_id: RootId,
}

/// A binding slot and the buffer bound there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferBind {
    pub binding: u32,
    pub buffer: BufferRef,
}

impl BufferBind {
    pub fn new(binding: u32, kind: BufferKind) -> Self {
        Self {
            binding,
            buffer: BufferRef {
                kind,
                root_id: RootId::default(),
            },
        }
    }
}

/// One compiled compute entry point within a kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task name; also the file stem of its shader library.
    pub name: String,
    /// Advisory total number of work items.
    #[serde(default)]
    pub advisory_total_num_threads: i64,
    /// Advisory threads per group. Zero means no preference.
    #[serde(default)]
    pub advisory_num_threads_per_group: u32,
    #[serde(default)]
    pub buffer_binds: Vec<BufferBind>,
}

impl TaskInfo {
    /// Returns true if the task reads a scalar argument record.
    pub fn needs_args(&self) -> bool {
        self.buffer_binds
            .iter()
            .any(|bind| bind.buffer.kind == BufferKind::Args)
    }

    /// Returns true if the task uses the global temporaries buffer.
    pub fn needs_global_tmps(&self) -> bool {
        self.buffer_binds
            .iter()
            .any(|bind| bind.buffer.kind == BufferKind::GlobalTmps)
    }

    /// Number of work items to launch, never less than one.
    pub fn total_threads(&self) -> u32 {
        self.advisory_total_num_threads.clamp(1, u32::MAX as i64) as u32
    }
}

/// A named kernel: an ordered sequence of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub name: String,
    #[serde(rename = "tasks_attribs", default)]
    pub tasks: Vec<TaskInfo>,
}

/// A named field and its placement in the arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub field_name: String,
    /// Byte offset of the field inside the arena.
    pub mem_offset_in_parent: usize,
    /// Field shape; empty for scalars.
    #[serde(default)]
    pub shape: Vec<usize>,
    /// Per-element shape for vector/matrix fields; empty for scalar elements.
    #[serde(default)]
    pub element_shape: Vec<usize>,
}

impl FieldInfo {
    /// Number of scalar elements stored in the field, or `None` when the
    /// shape product does not fit in `usize`.
    pub fn num_elements(&self) -> Option<usize> {
        self.shape
            .iter()
            .chain(&self.element_shape)
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
    }

    /// Byte extent of the field, or `None` on overflow.
    pub fn byte_len(&self) -> Option<usize> {
        self.num_elements()?.checked_mul(FIELD_ELEMENT_BYTES)
    }
}

/// Kernel export metadata. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AotMetadata {
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
    #[serde(default)]
    pub kernels: Vec<KernelInfo>,
    /// Total arena size in bytes.
    pub root_buffer_size: usize,
}

impl AotMetadata {
    /// Parses metadata from a JSON string.
    pub fn from_json(json: &str) -> RuntimeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads metadata from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| RuntimeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|field| field.field_name == name)
    }

    /// Looks up a kernel by name.
    pub fn kernel(&self, name: &str) -> Option<&KernelInfo> {
        self.kernels.iter().find(|kernel| kernel.name == name)
    }

    /// Maps every task name to the kernel that owns it.
    pub fn task_owners(&self) -> impl Iterator<Item = (&str, &str)> {
        self.kernels.iter().flat_map(|kernel| {
            kernel
                .tasks
                .iter()
                .map(move |task| (task.name.as_str(), kernel.name.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORTED: &str = r#"
    {
      "fields": [
        {"field_name": "x", "dtype": 0, "shape": [784], "element_shape": [], "mem_offset_in_parent": 0, "is_scalar": true},
        {"field_name": "label", "dtype": 1, "shape": [], "mem_offset_in_parent": 3136},
        {"field_name": "w", "shape": [10, 784], "mem_offset_in_parent": 3140}
      ],
      "kernels": [
        {
          "name": "mnist_apply_grad",
          "ctx_attribs": {"arg_attribs_vec_": []},
          "tasks_attribs": [
            {
              "name": "mnist_apply_grad_c80_00",
              "advisory_total_num_threads": 7840,
              "advisory_num_threads_per_group": 128,
              "task_type": 2,
              "buffer_binds": [
                {"binding": 0, "buffer": {"type": 0, "root_id": [0]}},
                {"binding": 1, "buffer": {"type": 1, "root_id": [-1]}},
                {"binding": 2, "buffer": {"type": 2, "root_id": [-1]}}
              ]
            }
          ]
        }
      ],
      "required_caps": [],
      "root_buffer_size": 34500
    }"#;

    #[test]
    fn test_parse_exported_metadata() {
        let metadata = AotMetadata::from_json(EXPORTED).unwrap();
        assert_eq!(metadata.root_buffer_size, 34500);
        assert_eq!(metadata.fields.len(), 3);

        let x = metadata.field("x").unwrap();
        assert_eq!(x.byte_len(), Some(784 * 4));
        let label = metadata.field("label").unwrap();
        assert_eq!(label.num_elements(), Some(1));
        assert_eq!(metadata.field("w").unwrap().byte_len(), Some(10 * 784 * 4));

        let kernel = metadata.kernel("mnist_apply_grad").unwrap();
        let task = &kernel.tasks[0];
        assert_eq!(task.total_threads(), 7840);
        assert!(task.needs_args());
        assert!(task.needs_global_tmps());
        assert_eq!(task.buffer_binds[0].buffer.kind, BufferKind::Root);
        assert!(task.buffer_binds[0].buffer.root_id.is_primary());
    }

    #[test]
    fn test_total_threads_never_zero() {
        let task = TaskInfo {
            name: "t".to_string(),
            advisory_total_num_threads: 0,
            advisory_num_threads_per_group: 0,
            buffer_binds: vec![],
        };
        assert_eq!(task.total_threads(), 1);

        let negative = TaskInfo {
            advisory_total_num_threads: -5,
            ..task
        };
        assert_eq!(negative.total_threads(), 1);
    }

    #[test]
    fn test_unknown_buffer_kind_is_preserved() {
        let bind: BufferBind =
            serde_json::from_str(r#"{"binding": 3, "buffer": {"type": 5, "root_id": 0}}"#).unwrap();
        assert_eq!(bind.buffer.kind, BufferKind::Other(5));
        assert_eq!(u32::from(bind.buffer.kind), 5);
    }

    #[test]
    fn test_task_owners() {
        let metadata = AotMetadata::from_json(EXPORTED).unwrap();
        let owners: Vec<_> = metadata.task_owners().collect();
        assert_eq!(owners, vec![("mnist_apply_grad_c80_00", "mnist_apply_grad")]);
    }

    #[test]
    fn test_oversized_shape_has_no_byte_len() {
        let field = FieldInfo {
            field_name: "w".to_string(),
            mem_offset_in_parent: 0,
            shape: vec![1 << 32, 1 << 32],
            element_shape: vec![],
        };
        assert_eq!(field.num_elements(), None);
        assert_eq!(field.byte_len(), None);

        let wide = FieldInfo {
            shape: vec![usize::MAX / 2],
            ..field
        };
        assert_eq!(wide.num_elements(), Some(usize::MAX / 2));
        assert_eq!(wide.byte_len(), None);
    }

    #[test]
    fn test_malformed_metadata() {
        let result = AotMetadata::from_json("{\"fields\": []}");
        assert!(matches!(result, Err(RuntimeError::MetadataParse { .. })));
    }
}
