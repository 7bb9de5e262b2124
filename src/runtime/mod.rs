//! Execution runtimes
//!
//! A runtime provides the memory and task primitives a compiled network
//! runs on: aligned instance and channel allocation, asynchronous task
//! start/wait, and an optional device memory space with host/device
//! transfers. `HostRuntime` is the always-available synchronous baseline;
//! `StreamRuntime` adds worker streams and an emulated device arena.

mod stream;

pub use stream::StreamRuntime;

use crate::compute::{CellId, Network};
use crossbeam_channel::Receiver;
use std::alloc::Layout;
use thiserror::Error;

/// Opaque device memory address. Zero is the null device pointer.
pub type DevicePtr = u64;
pub const NULL_DEV: DevicePtr = 0;

/// Runtime errors during allocation, task execution, and transfers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("instance allocation of {size} bytes failed")]
    Allocation { size: usize },

    #[error("device allocation of {size} bytes failed")]
    DeviceAllocation { size: usize },

    #[error("runtime has no device memory")]
    NoDevice,

    #[error("invalid device pointer {0:#x}")]
    InvalidDevicePtr(DevicePtr),

    #[error("task {0} failed: {1}")]
    TaskFailed(usize, String),

    #[error("task {0} was not started")]
    TaskNotStarted(usize),

    #[error("runtime does not support asynchronous tasks")]
    NoAsync,

    #[error("invalid program counter {0}")]
    InvalidProgram(usize),

    #[error("operand {0} is not bound to memory")]
    UnboundOperand(usize),
}

/// Work item for an asynchronous task.
pub type TaskFn = Box<dyn FnOnce() -> Result<(), RuntimeError> + Send + 'static>;

/// Handle for a started task. Synchronous runtimes run the task inline and
/// return an empty handle.
pub struct TaskHandle {
    pub(crate) rx: Option<Receiver<Result<(), RuntimeError>>>,
}

impl TaskHandle {
    pub fn completed() -> TaskHandle {
        TaskHandle { rx: None }
    }
}

/// Raw execution context handed to a task closure. The pointers stay valid
/// until the owning compute call returns, which always joins its tasks
/// first.
#[derive(Clone, Copy)]
pub struct TaskCtx {
    pub net: *const Network,
    pub cell: CellId,
    pub data: *mut u8,
    pub device: DevicePtr,
    pub entry: usize,
}

unsafe impl Send for TaskCtx {}

/// Runtime support for executing compiled networks.
pub trait Runtime: Send + Sync {
    /// Human-readable description of the runtime.
    fn description(&self) -> String;

    /// Extra bytes reserved at the start of each instance block for
    /// runtime-private data.
    fn extra_instance_data(&self) -> usize {
        0
    }

    /// Allocate an aligned instance block.
    fn allocate_instance(&self, size: usize, align: usize) -> Result<*mut u8, RuntimeError>;

    /// Free an instance block.
    fn free_instance(&self, data: *mut u8, size: usize, align: usize);

    /// Allocate aligned channel storage.
    fn allocate_channel(&self, size: usize, align: usize) -> Result<*mut u8, RuntimeError>;

    /// Free channel storage.
    fn free_channel(&self, data: *mut u8, size: usize, align: usize);

    /// Check if the runtime can run tasks in parallel.
    fn supports_async(&self) -> bool;

    /// Start a task. Synchronous runtimes run it inline.
    fn start_task(&self, task: TaskFn) -> Result<TaskHandle, RuntimeError>;

    /// Wait for a started task to complete.
    fn wait_task(&self, handle: TaskHandle) -> Result<(), RuntimeError>;

    /// Wait for asynchronous operations on the main path to complete.
    fn sync_main(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Check if the runtime has a device memory space.
    fn supports_device(&self) -> bool {
        false
    }

    /// Allocate device memory.
    fn allocate_device(&self, size: usize) -> Result<DevicePtr, RuntimeError> {
        Err(RuntimeError::DeviceAllocation { size })
    }

    /// Free device memory.
    fn free_device(&self, _ptr: DevicePtr) {}

    /// Copy a host region into device memory.
    ///
    /// # Safety
    /// `host` must be valid for `size` bytes.
    unsafe fn copy_to_device(
        &self,
        _host: *const u8,
        _device: DevicePtr,
        _offset: usize,
        _size: usize,
    ) -> Result<(), RuntimeError> {
        Err(RuntimeError::NoDevice)
    }

    /// Copy a device region into host memory.
    ///
    /// # Safety
    /// `host` must be valid for `size` bytes.
    unsafe fn copy_to_host(
        &self,
        _device: DevicePtr,
        _offset: usize,
        _host: *mut u8,
        _size: usize,
    ) -> Result<(), RuntimeError> {
        Err(RuntimeError::NoDevice)
    }

    /// Upload constant data to device memory, returning its address.
    fn upload_constant(&self, _data: &[u8]) -> Result<DevicePtr, RuntimeError> {
        Err(RuntimeError::NoDevice)
    }

    /// Remove an uploaded constant.
    fn remove_constant(&self, _ptr: DevicePtr) {}
}

fn layout(size: usize, align: usize) -> Layout {
    Layout::from_size_align(size.max(1), align.max(1).next_power_of_two())
        .unwrap_or(Layout::new::<u8>())
}

pub(crate) fn alloc_aligned(size: usize, align: usize) -> Result<*mut u8, RuntimeError> {
    let layout = layout(size, align);
    let data = unsafe { std::alloc::alloc_zeroed(layout) };
    if data.is_null() {
        return Err(RuntimeError::Allocation { size });
    }
    Ok(data)
}

pub(crate) fn free_aligned(data: *mut u8, size: usize, align: usize) {
    if !data.is_null() {
        unsafe {
            std::alloc::dealloc(data, layout(size, align));
        }
    }
}

/// Synchronous host runtime. Instance and channel memory come from the
/// system allocator; tasks run inline on the calling thread.
#[derive(Debug, Default)]
pub struct HostRuntime;

impl HostRuntime {
    pub fn new() -> HostRuntime {
        HostRuntime
    }
}

impl Runtime for HostRuntime {
    fn description(&self) -> String {
        "host runtime with synchronous task execution".to_string()
    }

    fn allocate_instance(&self, size: usize, align: usize) -> Result<*mut u8, RuntimeError> {
        alloc_aligned(size, align)
    }

    fn free_instance(&self, data: *mut u8, size: usize, align: usize) {
        free_aligned(data, size, align);
    }

    fn allocate_channel(&self, size: usize, align: usize) -> Result<*mut u8, RuntimeError> {
        alloc_aligned(size, align)
    }

    fn free_channel(&self, data: *mut u8, size: usize, align: usize) {
        free_aligned(data, size, align);
    }

    fn supports_async(&self) -> bool {
        false
    }

    fn start_task(&self, task: TaskFn) -> Result<TaskHandle, RuntimeError> {
        // Run the task inline; the handle is already completed.
        task()?;
        Ok(TaskHandle::completed())
    }

    fn wait_task(&self, handle: TaskHandle) -> Result<(), RuntimeError> {
        match handle.rx {
            None => Ok(()),
            Some(rx) => rx
                .recv()
                .unwrap_or(Err(RuntimeError::TaskFailed(0, "worker gone".to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_allocation() {
        let data = alloc_aligned(100, 64).unwrap();
        assert_eq!(data as usize % 64, 0);
        unsafe {
            assert_eq!(*data, 0);
        }
        free_aligned(data, 100, 64);
    }

    #[test]
    fn test_host_runtime_runs_tasks_inline() {
        let rt = HostRuntime::new();
        assert!(!rt.supports_async());
        let handle = rt.start_task(Box::new(|| Ok(()))).unwrap();
        rt.wait_task(handle).unwrap();
    }

    #[test]
    fn test_host_runtime_task_error() {
        let rt = HostRuntime::new();
        let result = rt.start_task(Box::new(|| {
            Err(RuntimeError::TaskFailed(1, "boom".to_string()))
        }));
        assert!(result.is_err());
    }
}
