//! Per-call arena for foreign-heap allocations.

use tracing::{trace, warn};
use super::module::{NativeModule, NativePtr};
use crate::utils::{BridgeError, BridgeResult};

/// How a tracked allocation is given back to the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Allocator `free`
    Free,
    /// Result deallocator for module-produced buffers
    ResultFree,
    /// Dedicated destructor export taking the pointer
    Call(&'static str),
}

#[derive(Debug)]
struct Allocation {
    ptr: NativePtr,
    release: Release,
    resource: &'static str,
}

/// Tracks every foreign-heap allocation made on behalf of one native call.
///
/// Each registered pointer is released exactly once: either explicitly via
/// [`release`](Self::release) / [`take`](Self::take), or when the scope is
/// dropped, in reverse order of registration. Release failures during drop
/// are logged, never raised.
pub struct NativeScope<'m> {
    module: &'m mut dyn NativeModule,
    live: Vec<Allocation>,
}

impl<'m> NativeScope<'m> {
    pub fn new(module: &'m mut dyn NativeModule) -> Self {
        Self { module, live: Vec::new() }
    }

    /// Direct access to the module for calls that don't allocate.
    pub fn module(&mut self) -> &mut dyn NativeModule {
        &mut *self.module
    }

    /// Allocates `size` bytes, failing with `AllocationFailure` on null.
    pub fn alloc(&mut self, size: usize, resource: &'static str) -> BridgeResult<NativePtr> {
        let ptr = self.module.malloc(size.max(1))?;
        if ptr == 0 {
            return Err(BridgeError::allocation(resource));
        }
        trace!("Allocated {} bytes for {} at {:#x}", size, resource, ptr);
        self.live.push(Allocation { ptr, release: Release::Free, resource });
        Ok(ptr)
    }

    /// Allocates and fills a buffer.
    pub fn alloc_bytes(&mut self, bytes: &[u8], resource: &'static str) -> BridgeResult<NativePtr> {
        let ptr = self.alloc(bytes.len(), resource)?;
        self.module.write(ptr, bytes)?;
        Ok(ptr)
    }

    /// Takes ownership of memory the module allocated itself. Null is ignored.
    pub fn adopt(&mut self, ptr: NativePtr, release: Release, resource: &'static str) -> NativePtr {
        if ptr != 0 {
            self.live.push(Allocation { ptr, release, resource });
        }
        ptr
    }

    /// Releases a tracked pointer now instead of at scope end.
    ///
    /// Pointers the scope does not (or no longer) track are left alone.
    pub fn release(&mut self, ptr: NativePtr) -> BridgeResult<()> {
        match self.live.iter().rposition(|a| a.ptr == ptr) {
            Some(index) => {
                let allocation = self.live.remove(index);
                release_one(&mut *self.module, &allocation)
            }
            None => Ok(()),
        }
    }

    /// Copies `len` bytes out of a tracked buffer, then releases it.
    pub fn take(&mut self, ptr: NativePtr, len: usize) -> BridgeResult<Vec<u8>> {
        let bytes = self.module.read(ptr, len);
        self.release(ptr)?;
        bytes
    }

    /// Number of allocations still owned by the scope.
    pub fn outstanding(&self) -> usize {
        self.live.len()
    }
}

fn release_one(module: &mut dyn NativeModule, allocation: &Allocation) -> BridgeResult<()> {
    trace!("Releasing {} at {:#x}", allocation.resource, allocation.ptr);
    match allocation.release {
        Release::Free => module.free(allocation.ptr),
        Release::ResultFree => module.free_result(allocation.ptr),
        Release::Call(export) => module.call(export, &[allocation.ptr.into()]).map(|_| ()),
    }
}

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        while let Some(allocation) = self.live.pop() {
            if let Err(e) = release_one(&mut *self.module, &allocation) {
                warn!("Failed to release {} at {:#x}: {}", allocation.resource, allocation.ptr, e);
            }
        }
    }
}
