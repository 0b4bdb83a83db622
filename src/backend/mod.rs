//! Compute backends the runtime dispatches tasks on.
//!
//! A backend owns the arena and one loaded library per task. The runtime
//! decides what runs and in which order; the backend only loads, binds and
//! launches. Two implementations exist: [`crate::gpu::WgpuBackend`] runs the
//! exported SPIR-V through wgpu, [`HostBackend`] runs registered Rust closures
//! on a host-side arena.

pub mod host;

pub use host::{HostBackend, HostInvocation, HostTask};

use log::warn;

use crate::errors::{RuntimeError, RuntimeResult};
use crate::metadata::{BufferKind, TaskInfo};

/// Scalar argument record bound to tasks that take a single `f32` argument.
///
/// The record is 16 bytes: the value followed by 12 bytes of padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ScalarArgs {
    pub value: f32,
    pub padding: [u32; 3],
}

impl ScalarArgs {
    pub const SIZE_BYTES: usize = 16;

    pub fn new(value: f32) -> Self {
        Self {
            value,
            padding: [0; 3],
        }
    }
}

/// One task launch within a submitted unit of work.
#[derive(Debug, Clone, Copy)]
pub struct TaskLaunch<'a> {
    pub task: &'a TaskInfo,
    /// Threads per group, already clamped to the device maximum.
    pub group_width: u32,
    /// Total work items, at least one.
    pub total_threads: u32,
    /// Scalar argument for tasks that bind the argument buffer.
    pub scalar: Option<f32>,
}

impl TaskLaunch<'_> {
    /// Number of groups needed to cover every work item.
    pub fn group_count(&self) -> u32 {
        self.total_threads.div_ceil(self.group_width.max(1))
    }

    /// Group count limited to `max_groups`. Work items past the limit are
    /// not launched, so clamping is logged.
    pub fn clamped_group_count(&self, max_groups: u32) -> u32 {
        let groups = self.group_count();
        if groups > max_groups {
            warn!(
                "task {} needs {} groups of {} but the device allows {}; {} work items will not run",
                self.task.name,
                groups,
                self.group_width,
                max_groups,
                self.total_threads as u64 - max_groups as u64 * self.group_width.max(1) as u64
            );
            return max_groups;
        }
        groups
    }
}

/// A device able to hold the arena and run exported tasks.
pub trait ComputeBackend: Send {
    /// Short human readable backend name.
    fn name(&self) -> &str;

    /// Largest number of threads a single group may hold.
    fn max_threads_per_group(&self) -> u32;

    /// Loads the library of a task so it can be launched later.
    fn load_task(&mut self, task: &TaskInfo) -> RuntimeResult<()>;

    /// Allocates the zero-initialized arena.
    fn allocate_arena(&mut self, size: usize) -> RuntimeResult<()>;

    /// Copies bytes into the arena at `offset`.
    fn write_arena(&mut self, offset: usize, bytes: &[u8]) -> RuntimeResult<()>;

    /// Reads `len` bytes of the arena starting at `offset`.
    fn read_arena(&mut self, offset: usize, len: usize) -> RuntimeResult<Vec<u8>>;

    /// Runs the launches in order as one unit of work and blocks until the
    /// device has finished them.
    fn submit(&mut self, launches: &[TaskLaunch<'_>]) -> RuntimeResult<()>;
}

/// Rejects tasks that bind buffers the runtime cannot provide.
pub fn check_buffer_binds(task: &TaskInfo) -> RuntimeResult<()> {
    for bind in &task.buffer_binds {
        let supported = match bind.buffer.kind {
            BufferKind::Root => bind.buffer.root_id.is_primary(),
            BufferKind::GlobalTmps | BufferKind::Args => true,
            BufferKind::Other(_) => false,
        };
        if !supported {
            return Err(RuntimeError::UnsupportedBufferBinding {
                task: task.name.clone(),
                kind: bind.buffer.kind.into(),
            });
        }
    }
    Ok(())
}

/// Checks that an arena access is 4-byte aligned and in bounds.
pub fn check_arena_range(offset: usize, len: usize, arena_size: usize) -> RuntimeResult<()> {
    if offset % 4 != 0 || len % 4 != 0 {
        return Err(RuntimeError::MisalignedAccess { offset, len });
    }
    let end = offset
        .checked_add(len)
        .ok_or(RuntimeError::ArenaOutOfBounds {
            offset,
            end: usize::MAX,
            arena_size,
        })?;
    if end > arena_size {
        return Err(RuntimeError::ArenaOutOfBounds {
            offset,
            end,
            arena_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_args_layout() {
        assert_eq!(std::mem::size_of::<ScalarArgs>(), ScalarArgs::SIZE_BYTES);
        let args = ScalarArgs::new(0.5);
        let bytes = bytemuck::bytes_of(&args);
        assert_eq!(&bytes[..4], &0.5f32.to_le_bytes());
        assert!(bytes[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_check_arena_range() {
        assert!(check_arena_range(0, 16, 16).is_ok());
        assert!(matches!(
            check_arena_range(2, 4, 16),
            Err(RuntimeError::MisalignedAccess { offset: 2, len: 4 })
        ));
        assert!(matches!(
            check_arena_range(12, 8, 16),
            Err(RuntimeError::ArenaOutOfBounds { end: 20, .. })
        ));
    }

    #[test]
    fn test_unsupported_binding() {
        use crate::metadata::BufferBind;

        let task = TaskInfo {
            name: "t".to_string(),
            advisory_total_num_threads: 1,
            advisory_num_threads_per_group: 1,
            buffer_binds: vec![
                BufferBind::new(0, BufferKind::Root),
                BufferBind::new(1, BufferKind::Other(3)),
            ],
        };
        assert!(matches!(
            check_buffer_binds(&task),
            Err(RuntimeError::UnsupportedBufferBinding { kind: 3, .. })
        ));
    }

    #[test]
    fn test_group_count() {
        let task = TaskInfo {
            name: "t".to_string(),
            advisory_total_num_threads: 784,
            advisory_num_threads_per_group: 128,
            buffer_binds: vec![],
        };
        let launch = TaskLaunch {
            task: &task,
            group_width: 128,
            total_threads: 784,
            scalar: None,
        };
        assert_eq!(launch.group_count(), 7);

        let single = TaskLaunch {
            total_threads: 1,
            ..launch
        };
        assert_eq!(single.group_count(), 1);
    }

    #[test]
    fn test_group_count_is_clamped_to_device_limit() {
        let task = TaskInfo {
            name: "wide".to_string(),
            advisory_total_num_threads: 70_000 * 64,
            advisory_num_threads_per_group: 64,
            buffer_binds: vec![],
        };
        let launch = TaskLaunch {
            task: &task,
            group_width: 64,
            total_threads: task.total_threads(),
            scalar: None,
        };
        assert_eq!(launch.group_count(), 70_000);
        assert_eq!(launch.clamped_group_count(65_535), 65_535);
        assert_eq!(launch.clamped_group_count(70_000), 70_000);
    }
}
