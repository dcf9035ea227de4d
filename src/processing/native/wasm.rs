//! wasmtime backend for [`NativeModule`].
//!
//! Modules are compiled once into a [`WasmImage`] and instantiated per user:
//! the codec context owns one instance, thread-pool workers each own another.
//! Modules built with threads import a shared `env.memory`; one shared memory
//! is created per image and linked into every instance, so all instances
//! address the same heap.

use std::cell::UnsafeCell;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use wasmtime::{Config, Engine, ExternType, Instance, Linker, Memory, Module, SharedMemory, Store, Val, ValType};

use super::module::{AllocatorExports, ModuleImage, ModuleLoader, NativeModule, NativePtr, NativeValue};
use crate::utils::{module_path, read_module_bytes, BridgeError, BridgeResult};

/// Reactor-style initializer. Runs once per instance for private memories
/// and once per image when the heap is shared.
const INITIALIZE: &str = "_initialize";
const MEMORY_EXPORT: &str = "memory";

fn init_error(context: &str, e: wasmtime::Error) -> BridgeError {
    BridgeError::initialization(format!("{context}: {e:#}"))
}

/// Loads modules from the filesystem and compiles them with a shared engine.
#[derive(Clone)]
pub struct WasmLoader {
    engine: Engine,
}

impl WasmLoader {
    pub fn new() -> BridgeResult<Self> {
        let mut config = Config::new();
        config.wasm_threads(true);
        config.wasm_bulk_memory(true);
        config.wasm_simd(true);
        let engine = Engine::new(&config).map_err(|e| init_error("Failed to create wasm engine", e))?;
        Ok(Self { engine })
    }

    fn load(&self, location: &str, allocator: AllocatorExports) -> BridgeResult<Arc<dyn ModuleImage>> {
        let bytes = read_module_bytes(location)?;
        let name = module_path(location)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module")
            .to_string();
        let image = WasmImage::compile(name, &self.engine, &bytes, allocator)?;
        Ok(Arc::new(image))
    }
}

impl ModuleLoader for WasmLoader {
    fn load_primary(&self, location: &str) -> BridgeResult<Arc<dyn ModuleImage>> {
        self.load(location, AllocatorExports::PRIMARY)
    }

    fn load_secondary(&self, location: &str) -> BridgeResult<Arc<dyn ModuleImage>> {
        self.load(location, AllocatorExports::QUANT)
    }
}

/// Shared memory import and the name it is imported under.
#[derive(Clone)]
struct SharedImport {
    module: String,
    name: String,
    memory: SharedMemory,
}

/// A compiled module ready to be instantiated.
pub struct WasmImage {
    name: String,
    engine: Engine,
    module: Module,
    allocator: AllocatorExports,
    shared: Option<SharedImport>,
    /// Set once the shared heap has been initialized by some instance
    initialized: Mutex<bool>,
}

impl WasmImage {
    pub fn compile(name: String, engine: &Engine, bytes: &[u8], allocator: AllocatorExports) -> BridgeResult<Self> {
        let module = Module::new(engine, bytes).map_err(|e| init_error(&format!("Failed to compile {name}"), e))?;

        let shared = module
            .imports()
            .find_map(|import| match import.ty() {
                ExternType::Memory(ty) if ty.is_shared() => {
                    Some((import.module().to_string(), import.name().to_string(), ty))
                }
                _ => None,
            })
            .map(|(module_name, import_name, ty)| {
                SharedMemory::new(engine, ty)
                    .map(|memory| SharedImport { module: module_name, name: import_name, memory })
                    .map_err(|e| init_error("Failed to create shared memory", e))
            })
            .transpose()?;

        info!("Compiled {} ({} bytes, shared memory: {})", name, bytes.len(), shared.is_some());
        Ok(Self {
            name,
            engine: engine.clone(),
            module,
            allocator,
            shared,
            initialized: Mutex::new(false),
        })
    }
}

impl ModuleImage for WasmImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn instantiate(&self) -> BridgeResult<Box<dyn NativeModule>> {
        let mut store = Store::new(&self.engine, ());
        let mut linker: Linker<()> = Linker::new(&self.engine);
        if let Some(shared) = &self.shared {
            linker
                .define(&store, &shared.module, &shared.name, shared.memory.clone())
                .map_err(|e| init_error("Failed to link shared memory", e))?;
        }
        linker
            .define_unknown_imports_as_traps(&self.module)
            .map_err(|e| init_error("Failed to stub imports", e))?;
        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| init_error(&format!("Failed to instantiate {}", self.name), e))?;

        let mut initialized = self
            .initialized
            .lock()
            .map_err(|_| BridgeError::initialization(format!("{} initializer state is poisoned", self.name)))?;
        let heap_ready = self.shared.is_some() && *initialized;
        match instance.get_func(&mut store, INITIALIZE) {
            Some(_) if heap_ready => debug!("{} shares an initialized heap, skipping {}", self.name, INITIALIZE),
            Some(init) => init
                .call(&mut store, &[], &mut [])
                .map_err(|e| init_error(&format!("{} initializer trapped", self.name), e))?,
            None => {}
        }
        *initialized = true;
        drop(initialized);

        let memory = match &self.shared {
            Some(shared) => LinearMemory::Shared(shared.memory.clone()),
            None => instance
                .get_memory(&mut store, MEMORY_EXPORT)
                .map(LinearMemory::Own)
                .ok_or_else(|| BridgeError::initialization(format!("{} exports no memory", self.name)))?,
        };

        debug!("Instantiated {}", self.name);
        Ok(Box::new(WasmModule {
            store,
            instance,
            module: self.module.clone(),
            memory,
            allocator: self.allocator,
        }))
    }
}

enum LinearMemory {
    Own(Memory),
    Shared(SharedMemory),
}

/// One live instance.
pub struct WasmModule {
    store: Store<()>,
    instance: Instance,
    module: Module,
    memory: LinearMemory,
    allocator: AllocatorExports,
}

impl WasmModule {
    fn shared_range(data: &[UnsafeCell<u8>], ptr: NativePtr, len: usize) -> BridgeResult<usize> {
        let start = ptr as usize;
        match start.checked_add(len) {
            Some(end) if end <= data.len() => Ok(start),
            _ => Err(out_of_bounds(ptr, len)),
        }
    }
}

fn out_of_bounds(ptr: NativePtr, len: usize) -> BridgeError {
    BridgeError::fault(format!("memory access out of bounds: {len} bytes at {ptr:#x}"))
}

impl NativeModule for WasmModule {
    fn has_export(&self, export: &str) -> bool {
        matches!(self.module.get_export(export), Some(ExternType::Func(_)))
    }

    fn call(&mut self, export: &str, args: &[NativeValue]) -> BridgeResult<Option<NativeValue>> {
        let func = self
            .instance
            .get_func(&mut self.store, export)
            .ok_or_else(|| BridgeError::unavailable(export))?;
        let ty = func.ty(&self.store);
        if ty.params().len() != args.len() {
            return Err(BridgeError::fault(format!(
                "`{export}` takes {} arguments, {} given",
                ty.params().len(),
                args.len()
            )));
        }
        let params = ty
            .params()
            .zip(args)
            .map(|(param, arg)| coerce(&param, *arg))
            .collect::<BridgeResult<Vec<Val>>>()?;
        let mut results = vec![Val::I32(0); ty.results().len()];

        func.call(&mut self.store, &params, &mut results)
            .map_err(|e| BridgeError::fault(format!("`{export}` trapped: {e:#}")))?;

        results.first().map(from_val).transpose()
    }

    fn read(&self, ptr: NativePtr, len: usize) -> BridgeResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        match &self.memory {
            LinearMemory::Own(memory) => memory
                .read(&self.store, ptr as usize, &mut buf)
                .map_err(|_| out_of_bounds(ptr, len))?,
            LinearMemory::Shared(memory) => {
                let data = memory.data();
                let start = Self::shared_range(data, ptr, len)?;
                // SAFETY: the range is in bounds; other instances may write concurrently,
                // which the native side synchronizes itself, as with any shared heap.
                unsafe {
                    std::ptr::copy_nonoverlapping(UnsafeCell::raw_get(data.as_ptr().add(start)), buf.as_mut_ptr(), len);
                }
            }
        }
        Ok(buf)
    }

    fn write(&mut self, ptr: NativePtr, bytes: &[u8]) -> BridgeResult<()> {
        match &self.memory {
            LinearMemory::Own(memory) => memory
                .write(&mut self.store, ptr as usize, bytes)
                .map_err(|_| out_of_bounds(ptr, bytes.len())),
            LinearMemory::Shared(memory) => {
                let data = memory.data();
                let start = Self::shared_range(data, ptr, bytes.len())?;
                // SAFETY: bounds checked above; UnsafeCell grants write access through a shared reference.
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), UnsafeCell::raw_get(data.as_ptr().add(start)), bytes.len());
                }
                Ok(())
            }
        }
    }

    fn allocator(&self) -> AllocatorExports {
        self.allocator
    }
}

/// Converts an argument to the parameter type the export declares.
fn coerce(param: &ValType, value: NativeValue) -> BridgeResult<Val> {
    Ok(match param {
        ValType::I32 => Val::I32(match value {
            NativeValue::I32(v) => v,
            NativeValue::I64(v) => v as i32,
            other => other.as_f64() as i32,
        }),
        ValType::I64 => Val::I64(match value {
            NativeValue::I32(v) => i64::from(v),
            NativeValue::I64(v) => v,
            other => other.as_f64() as i64,
        }),
        ValType::F32 => Val::F32((value.as_f64() as f32).to_bits()),
        ValType::F64 => Val::F64(value.as_f64().to_bits()),
        other => return Err(BridgeError::fault(format!("unsupported parameter type {other:?}"))),
    })
}

fn from_val(val: &Val) -> BridgeResult<NativeValue> {
    match val {
        Val::I32(v) => Ok(NativeValue::I32(*v)),
        Val::I64(v) => Ok(NativeValue::I64(*v)),
        Val::F32(bits) => Ok(NativeValue::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Ok(NativeValue::F64(f64::from_bits(*bits))),
        _ => Err(BridgeError::fault("unsupported return type")),
    }
}
