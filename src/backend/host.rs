//! Host-side backend running registered Rust closures on an in-memory arena.
//!
//! Useful as a deterministic stand-in for the exported kernels: tests and
//! machines without a GPU register one closure per task name and the runtime
//! drives them exactly like device tasks.

use std::collections::{HashMap, HashSet};

use log::debug;

use super::{ComputeBackend, TaskLaunch, check_arena_range, check_buffer_binds};
use crate::errors::{RuntimeError, RuntimeResult};
use crate::metadata::TaskInfo;

/// Default group width limit reported by the host backend.
pub const DEFAULT_HOST_MAX_THREADS_PER_GROUP: u32 = 1024;

/// Largest arena the host backend will allocate (1 GiB).
pub const MAX_HOST_ARENA_BYTES: usize = 1 << 30;

/// Host implementation of one task.
pub type HostTask = Box<dyn Fn(&mut HostInvocation<'_>) -> RuntimeResult<()> + Send + Sync>;

/// Arguments handed to a host task.
pub struct HostInvocation<'a> {
    pub arena: &'a mut [u8],
    pub scalar: Option<f32>,
    pub group_width: u32,
    pub total_threads: u32,
}

impl HostInvocation<'_> {
    fn range(&self, offset: usize) -> RuntimeResult<std::ops::Range<usize>> {
        check_arena_range(offset, 4, self.arena.len())?;
        Ok(offset..offset + 4)
    }

    pub fn load_f32(&self, offset: usize) -> RuntimeResult<f32> {
        let range = self.range(offset)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.arena[range]);
        Ok(f32::from_le_bytes(bytes))
    }

    pub fn store_f32(&mut self, offset: usize, value: f32) -> RuntimeResult<()> {
        let range = self.range(offset)?;
        self.arena[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn load_i32(&self, offset: usize) -> RuntimeResult<i32> {
        let range = self.range(offset)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.arena[range]);
        Ok(i32::from_le_bytes(bytes))
    }

    /// Returns the scalar argument or zero when the launch carries none.
    pub fn scalar_or_zero(&self) -> f32 {
        self.scalar.unwrap_or(0.0)
    }
}

/// Record of a launch executed by the host backend.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub task: String,
    pub group_width: u32,
    pub total_threads: u32,
    pub scalar: Option<f32>,
    /// Index of the submission the launch belonged to.
    pub submission: usize,
}

/// Backend executing registered closures on a host-resident arena.
pub struct HostBackend {
    tasks: HashMap<String, HostTask>,
    loaded: HashSet<String>,
    arena: Option<Vec<u8>>,
    max_threads_per_group: u32,
    launches: Vec<LaunchRecord>,
    submissions: usize,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            loaded: HashSet::new(),
            arena: None,
            max_threads_per_group: DEFAULT_HOST_MAX_THREADS_PER_GROUP,
            launches: Vec::new(),
            submissions: 0,
        }
    }

    /// Overrides the group width limit the backend reports.
    pub fn with_max_threads_per_group(mut self, max: u32) -> Self {
        self.max_threads_per_group = max.max(1);
        self
    }

    /// Registers the implementation of a task.
    pub fn with_task<F>(mut self, name: impl Into<String>, task: F) -> Self
    where
        F: Fn(&mut HostInvocation<'_>) -> RuntimeResult<()> + Send + Sync + 'static,
    {
        self.register(name, task);
        self
    }

    /// Registers the implementation of a task, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Fn(&mut HostInvocation<'_>) -> RuntimeResult<()> + Send + Sync + 'static,
    {
        self.tasks.insert(name.into(), Box::new(task));
    }

    /// Current arena contents, if allocated.
    pub fn arena(&self) -> Option<&[u8]> {
        self.arena.as_deref()
    }

    /// Every launch executed so far, in order.
    pub fn launches(&self) -> &[LaunchRecord] {
        &self.launches
    }

    /// Number of submitted units of work.
    pub fn submissions(&self) -> usize {
        self.submissions
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn max_threads_per_group(&self) -> u32 {
        self.max_threads_per_group
    }

    fn load_task(&mut self, task: &TaskInfo) -> RuntimeResult<()> {
        check_buffer_binds(task)?;
        if !self.tasks.contains_key(&task.name) {
            return Err(RuntimeError::MissingHostTask {
                task: task.name.clone(),
            });
        }
        self.loaded.insert(task.name.clone());
        Ok(())
    }

    fn allocate_arena(&mut self, size: usize) -> RuntimeResult<()> {
        if size > MAX_HOST_ARENA_BYTES {
            return Err(RuntimeError::ArenaTooLarge {
                backend: self.name().to_string(),
                size,
                max: MAX_HOST_ARENA_BYTES,
            });
        }
        self.arena = Some(vec![0u8; size.next_multiple_of(4)]);
        Ok(())
    }

    fn write_arena(&mut self, offset: usize, bytes: &[u8]) -> RuntimeResult<()> {
        let arena = self.arena.as_mut().ok_or(RuntimeError::ArenaNotAllocated)?;
        check_arena_range(offset, bytes.len(), arena.len())?;
        arena[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_arena(&mut self, offset: usize, len: usize) -> RuntimeResult<Vec<u8>> {
        let arena = self.arena.as_ref().ok_or(RuntimeError::ArenaNotAllocated)?;
        check_arena_range(offset, len, arena.len())?;
        Ok(arena[offset..offset + len].to_vec())
    }

    fn submit(&mut self, launches: &[TaskLaunch<'_>]) -> RuntimeResult<()> {
        let arena = self.arena.as_mut().ok_or(RuntimeError::ArenaNotAllocated)?;
        let submission = self.submissions;
        self.submissions += 1;

        for launch in launches {
            let name = &launch.task.name;
            if !self.loaded.contains(name) {
                return Err(RuntimeError::TaskNotLoaded { task: name.clone() });
            }
            let task = self
                .tasks
                .get(name)
                .ok_or_else(|| RuntimeError::MissingHostTask { task: name.clone() })?;

            debug!(
                "host launch {} ({} threads, width {})",
                name, launch.total_threads, launch.group_width
            );
            let mut invocation = HostInvocation {
                arena: arena.as_mut_slice(),
                scalar: launch.scalar,
                group_width: launch.group_width,
                total_threads: launch.total_threads,
            };
            task(&mut invocation).map_err(|err| RuntimeError::DispatchFailed {
                task: name.clone(),
                message: err.to_string(),
            })?;

            self.launches.push(LaunchRecord {
                task: name.clone(),
                group_width: launch.group_width,
                total_threads: launch.total_threads,
                scalar: launch.scalar,
                submission,
            });
        }
        Ok(())
    }
}
