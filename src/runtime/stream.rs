//! Stream runtime
//!
//! Runtime with asynchronous task execution on a pool of worker streams and
//! an emulated device memory space kept in a separate arena. Cells compiled
//! against this runtime get real task parallelism: steps assigned to flow
//! tasks run on worker threads while the main task continues.

use super::{
    alloc_aligned, free_aligned, DevicePtr, Runtime, RuntimeError, TaskFn, TaskHandle, NULL_DEV,
};
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread::JoinHandle;

type Job = (TaskFn, Sender<Result<(), RuntimeError>>);

/// Device memory arena keyed by opaque device addresses.
#[derive(Default)]
struct DeviceArena {
    next: DevicePtr,
    blocks: HashMap<DevicePtr, Box<[u8]>>,
}

impl DeviceArena {
    fn allocate(&mut self, size: usize) -> DevicePtr {
        self.next += 1;
        let ptr = self.next << 32;
        self.blocks.insert(ptr, vec![0u8; size].into_boxed_slice());
        ptr
    }

    fn free(&mut self, ptr: DevicePtr) {
        self.blocks.remove(&ptr);
    }
}

/// Runtime with worker streams and emulated device memory.
pub struct StreamRuntime {
    tx: Option<Sender<Job>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    device: Mutex<DeviceArena>,
    streams: usize,
}

impl StreamRuntime {
    /// Create a runtime with the given number of worker streams.
    pub fn new(streams: usize) -> StreamRuntime {
        let streams = streams.max(1);
        let (tx, rx) = unbounded::<Job>();
        let mut threads = Vec::with_capacity(streams);
        for n in 0..streams {
            let rx = rx.clone();
            let thread = std::thread::Builder::new()
                .name(format!("stream-{}", n))
                .spawn(move || {
                    for (task, done) in rx.iter() {
                        let result = task();
                        let _ = done.send(result);
                    }
                })
                .expect("failed to spawn stream worker");
            threads.push(thread);
        }
        StreamRuntime {
            tx: Some(tx),
            threads: Mutex::new(threads),
            device: Mutex::new(DeviceArena::default()),
            streams,
        }
    }
}

impl Drop for StreamRuntime {
    fn drop(&mut self) {
        // Close the queue and join the workers.
        self.tx = None;
        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }
    }
}

impl Runtime for StreamRuntime {
    fn description(&self) -> String {
        format!(
            "stream runtime with {} worker streams and emulated device memory",
            self.streams
        )
    }

    fn extra_instance_data(&self) -> usize {
        // Runtime-private header at the start of each instance block.
        16
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
        true
    }

    fn start_task(&self, task: TaskFn) -> Result<TaskHandle, RuntimeError> {
        let tx = self.tx.as_ref().ok_or(RuntimeError::NoAsync)?;
        let (done_tx, done_rx) = bounded(1);
        tx.send((task, done_tx))
            .map_err(|_| RuntimeError::TaskFailed(0, "stream queue closed".to_string()))?;
        Ok(TaskHandle { rx: Some(done_rx) })
    }

    fn wait_task(&self, handle: TaskHandle) -> Result<(), RuntimeError> {
        match handle.rx {
            None => Ok(()),
            Some(rx) => rx
                .recv()
                .unwrap_or(Err(RuntimeError::TaskFailed(0, "stream gone".to_string()))),
        }
    }

    fn supports_device(&self) -> bool {
        true
    }

    fn allocate_device(&self, size: usize) -> Result<DevicePtr, RuntimeError> {
        Ok(self.device.lock().allocate(size))
    }

    fn free_device(&self, ptr: DevicePtr) {
        if ptr != NULL_DEV {
            self.device.lock().free(ptr);
        }
    }

    unsafe fn copy_to_device(
        &self,
        host: *const u8,
        device: DevicePtr,
        offset: usize,
        size: usize,
    ) -> Result<(), RuntimeError> {
        let mut arena = self.device.lock();
        let block = arena
            .blocks
            .get_mut(&device)
            .ok_or(RuntimeError::InvalidDevicePtr(device))?;
        if offset + size > block.len() {
            return Err(RuntimeError::InvalidDevicePtr(device));
        }
        std::ptr::copy_nonoverlapping(host, block.as_mut_ptr().add(offset), size);
        Ok(())
    }

    unsafe fn copy_to_host(
        &self,
        device: DevicePtr,
        offset: usize,
        host: *mut u8,
        size: usize,
    ) -> Result<(), RuntimeError> {
        let arena = self.device.lock();
        let block = arena
            .blocks
            .get(&device)
            .ok_or(RuntimeError::InvalidDevicePtr(device))?;
        if offset + size > block.len() {
            return Err(RuntimeError::InvalidDevicePtr(device));
        }
        std::ptr::copy_nonoverlapping(block.as_ptr().add(offset), host, size);
        Ok(())
    }

    fn upload_constant(&self, data: &[u8]) -> Result<DevicePtr, RuntimeError> {
        let mut arena = self.device.lock();
        let ptr = arena.allocate(data.len());
        if let Some(block) = arena.blocks.get_mut(&ptr) {
            block.copy_from_slice(data);
        }
        Ok(ptr)
    }

    fn remove_constant(&self, ptr: DevicePtr) {
        self.free_device(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_tasks_run_on_workers() {
        let rt = StreamRuntime::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            let handle = rt
                .start_task(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .unwrap();
            handles.push(handle);
        }
        for handle in handles {
            rt.wait_task(handle).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_task_error_propagates() {
        let rt = StreamRuntime::new(1);
        let handle = rt
            .start_task(Box::new(|| {
                Err(RuntimeError::TaskFailed(3, "bad".to_string()))
            }))
            .unwrap();
        assert!(rt.wait_task(handle).is_err());
    }

    #[test]
    fn test_device_memory_roundtrip() {
        let rt = StreamRuntime::new(1);
        let ptr = rt.allocate_device(64).unwrap();
        let data = [1u8, 2, 3, 4];
        let mut back = [0u8; 4];
        unsafe {
            rt.copy_to_device(data.as_ptr(), ptr, 8, 4).unwrap();
            rt.copy_to_host(ptr, 8, back.as_mut_ptr(), 4).unwrap();
        }
        assert_eq!(back, data);
        rt.free_device(ptr);
    }

    #[test]
    fn test_device_bounds_check() {
        let rt = StreamRuntime::new(1);
        let ptr = rt.allocate_device(16).unwrap();
        let data = [0u8; 8];
        let err = unsafe { rt.copy_to_device(data.as_ptr(), ptr, 12, 8) };
        assert!(err.is_err());
    }

    #[test]
    fn test_constant_upload() {
        let rt = StreamRuntime::new(1);
        let ptr = rt.upload_constant(&[7u8; 32]).unwrap();
        let mut back = [0u8; 32];
        unsafe {
            rt.copy_to_host(ptr, 0, back.as_mut_ptr(), 32).unwrap();
        }
        assert_eq!(back, [7u8; 32]);
        rt.remove_constant(ptr);
    }
}
