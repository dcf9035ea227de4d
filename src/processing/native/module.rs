//! Abstraction over a loaded native codec module.
//!
//! A module is an export table plus a flat linear memory addressed by 32-bit
//! offsets. The wasmtime backend lives in [`super::wasm`]; tests drive the
//! bridge through instrumented in-process implementations of the same trait.

use std::sync::Arc;
use crate::utils::{BridgeError, BridgeResult};

/// Offset into a module's linear memory. Zero is the null pointer.
pub type NativePtr = u32;

/// Longest C string the bridge will read back from a module.
const MAX_C_STRING: usize = 4096;

/// Scalar argument or return value of a native export.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl NativeValue {
    pub fn as_i32(self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(v),
            Self::I64(v) => i32::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Self::I32(v) => f64::from(v),
            Self::I64(v) => v as f64,
            Self::F32(v) => f64::from(v),
            Self::F64(v) => v,
        }
    }
}

impl From<i32> for NativeValue {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

/// Pointers and sizes travel as wasm32 `i32`s.
impl From<u32> for NativeValue {
    fn from(v: u32) -> Self {
        Self::I32(v as i32)
    }
}

impl From<f32> for NativeValue {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<bool> for NativeValue {
    fn from(v: bool) -> Self {
        Self::I32(i32::from(v))
    }
}

/// Names of the allocator exports a module uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorExports {
    pub alloc: &'static str,
    pub free: &'static str,
    /// Releases buffers the module allocated and handed back as results
    pub result_free: &'static str,
}

impl AllocatorExports {
    /// Primary codec module (emscripten libc allocator).
    pub const PRIMARY: Self = Self {
        alloc: "malloc",
        free: "free",
        result_free: "cpres_free",
    };

    /// Secondary quantization module.
    pub const QUANT: Self = Self {
        alloc: "pngx_bridge_alloc",
        free: "pngx_bridge_free",
        result_free: "pngx_bridge_result_free",
    };
}

/// An instantiated native module.
///
/// Implementors provide export dispatch and raw memory access; everything
/// else is built on top as provided methods.
pub trait NativeModule: Send {
    /// Whether the module exports a function with this name.
    fn has_export(&self, export: &str) -> bool;

    /// Calls an export. Returns `Ok(None)` for void functions.
    ///
    /// Calling a missing export is a [`BridgeError::ModuleUnavailable`];
    /// a trap is a [`BridgeError::NativeFault`].
    fn call(&mut self, export: &str, args: &[NativeValue]) -> BridgeResult<Option<NativeValue>>;

    /// Copies `len` bytes out of linear memory.
    fn read(&self, ptr: NativePtr, len: usize) -> BridgeResult<Vec<u8>>;

    /// Copies `bytes` into linear memory at `ptr`.
    fn write(&mut self, ptr: NativePtr, bytes: &[u8]) -> BridgeResult<()>;

    fn allocator(&self) -> AllocatorExports;

    /// Allocates `size` bytes; a null return is passed through unchanged.
    fn malloc(&mut self, size: usize) -> BridgeResult<NativePtr> {
        let Ok(size) = u32::try_from(size) else {
            return Ok(0);
        };
        let alloc = self.allocator().alloc;
        self.call_ptr(alloc, &[size.into()])
    }

    fn free(&mut self, ptr: NativePtr) -> BridgeResult<()> {
        let free = self.allocator().free;
        self.call(free, &[ptr.into()]).map(|_| ())
    }

    fn free_result(&mut self, ptr: NativePtr) -> BridgeResult<()> {
        let result_free = self.allocator().result_free;
        self.call(result_free, &[ptr.into()]).map(|_| ())
    }

    fn read_u32(&self, ptr: NativePtr) -> BridgeResult<u32> {
        let bytes: [u8; 4] = self.read(ptr, 4)?
            .as_slice()
            .try_into()
            .map_err(|_| BridgeError::fault(format!("short read at {ptr:#x}")))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_i32(&self, ptr: NativePtr) -> BridgeResult<i32> {
        self.read_u32(ptr).map(|v| v as i32)
    }

    fn read_f32(&self, ptr: NativePtr) -> BridgeResult<f32> {
        self.read_u32(ptr).map(f32::from_bits)
    }

    fn read_u8(&self, ptr: NativePtr) -> BridgeResult<u8> {
        self.read(ptr, 1)?
            .first()
            .copied()
            .ok_or_else(|| BridgeError::fault(format!("short read at {ptr:#x}")))
    }

    fn write_u32(&mut self, ptr: NativePtr, value: u32) -> BridgeResult<()> {
        self.write(ptr, &value.to_le_bytes())
    }

    /// Reads a NUL-terminated string, lossily decoded as UTF-8.
    fn read_c_string(&self, ptr: NativePtr) -> BridgeResult<String> {
        let mut bytes = Vec::new();
        let mut cursor = ptr;
        while bytes.len() < MAX_C_STRING {
            let byte = self.read_u8(cursor)?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cursor = cursor.checked_add(1).ok_or_else(|| BridgeError::fault("string runs past the end of memory"))?;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Calls an export that returns an `i32`.
    fn call_i32(&mut self, export: &str, args: &[NativeValue]) -> BridgeResult<i32> {
        self.call(export, args)?
            .and_then(NativeValue::as_i32)
            .ok_or_else(|| BridgeError::fault(format!("`{export}` did not return an i32")))
    }

    /// Calls an export that returns a pointer.
    fn call_ptr(&mut self, export: &str, args: &[NativeValue]) -> BridgeResult<NativePtr> {
        self.call_i32(export, args).map(|v| v as NativePtr)
    }

    /// Calls a zero-argument query export, `None` when the module lacks it.
    fn query_u32(&mut self, export: &str) -> BridgeResult<Option<u32>> {
        if !self.has_export(export) {
            return Ok(None);
        }
        self.call_i32(export, &[]).map(|v| Some(v as u32))
    }

    fn query_flag(&mut self, export: &str) -> BridgeResult<Option<bool>> {
        self.query_u32(export).map(|v| v.map(|v| v != 0))
    }
}

/// Compiled module that can be instantiated any number of times.
///
/// Thread-pool workers instantiate the same image once per OS thread.
pub trait ModuleImage: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    fn instantiate(&self) -> BridgeResult<Box<dyn NativeModule>>;
}

/// Resolves module locations to compiled images.
///
/// Loading is synchronous; callers run it on the blocking pool.
pub trait ModuleLoader: Send + Sync {
    fn load_primary(&self, location: &str) -> BridgeResult<Arc<dyn ModuleImage>>;

    fn load_secondary(&self, location: &str) -> BridgeResult<Arc<dyn ModuleImage>>;
}
