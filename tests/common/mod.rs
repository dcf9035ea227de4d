//! Instrumented in-process stand-ins for the native modules.
//!
//! Memory is a growable byte vector with a bump allocator that records every
//! live allocation, so tests can assert that each call leaves nothing behind.
//! Instances created from the same image share state, the way threaded wasm
//! instances share one heap.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use codec_bridge_lib::processing::native::{
    AllocatorExports, ModuleImage, ModuleLoader, NativeModule, NativePtr, NativeValue,
};
use codec_bridge_lib::{BridgeError, BridgeResult};

pub type Handler = Arc<dyn Fn(&mut MockState, &[NativeValue]) -> BridgeResult<Option<NativeValue>> + Send + Sync>;

pub const POOL_JOIN: &str = "pngx_bridge_thread_pool_join";

#[derive(Default)]
pub struct MockState {
    pub memory: Vec<u8>,
    next: u32,
    pub live: BTreeMap<NativePtr, usize>,
    pub allocations: usize,
    pub releases: usize,
    pub bad_releases: usize,
    /// Allocation attempt (0-based) that returns null
    pub fail_alloc_at: Option<usize>,
    alloc_attempts: usize,
    pub calls: Vec<(String, Vec<NativeValue>)>,
    pub last_error: i32,
    pub aux_error: i32,
    /// Buffers owned by an open palette session
    pub session: Vec<NativePtr>,
    /// Quantization results by handle: (status, quality, palette ptr, palette len, indices ptr, indices len)
    pub quant_results: HashMap<NativePtr, (i32, i32, NativePtr, usize, NativePtr, usize)>,
}

impl MockState {
    pub fn alloc(&mut self, size: usize) -> NativePtr {
        let attempt = self.alloc_attempts;
        self.alloc_attempts += 1;
        if self.fail_alloc_at == Some(attempt) {
            return 0;
        }
        let size = size.max(1);
        let ptr = (self.next.max(16) + 7) & !7;
        self.next = ptr + size as u32;
        if self.memory.len() < self.next as usize {
            self.memory.resize(self.next as usize, 0);
        }
        self.live.insert(ptr, size);
        self.allocations += 1;
        ptr
    }

    pub fn alloc_filled(&mut self, size: usize, byte: u8) -> NativePtr {
        let ptr = self.alloc(size);
        if ptr != 0 {
            let start = ptr as usize;
            self.memory[start..start + size].fill(byte);
        }
        ptr
    }

    pub fn release(&mut self, ptr: NativePtr) {
        if ptr == 0 {
            return;
        }
        if self.live.remove(&ptr).is_some() {
            self.releases += 1;
        } else {
            self.bad_releases += 1;
        }
    }

    pub fn read(&self, ptr: NativePtr, len: usize) -> BridgeResult<Vec<u8>> {
        let start = ptr as usize;
        self.memory
            .get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| BridgeError::fault(format!("mock read out of bounds at {ptr:#x}")))
    }

    pub fn write(&mut self, ptr: NativePtr, bytes: &[u8]) -> BridgeResult<()> {
        let start = ptr as usize;
        let end = start + bytes.len();
        if ptr == 0 || end > self.memory.len() {
            return Err(BridgeError::fault(format!("mock write out of bounds at {ptr:#x}")));
        }
        self.memory[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u32(&mut self, ptr: NativePtr, value: u32) -> BridgeResult<()> {
        self.write(ptr, &value.to_le_bytes())
    }

    pub fn calls_to(&self, export: &str) -> Vec<Vec<NativeValue>> {
        self.calls.iter().filter(|(name, _)| name == export).map(|(_, args)| args.clone()).collect()
    }

    pub fn call_count(&self, export: &str) -> usize {
        self.calls.iter().filter(|(name, _)| name == export).count()
    }

    /// Exports called whose name starts with `prefix`, in call order.
    pub fn called_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.calls.iter().filter(|(name, _)| name.starts_with(prefix)).map(|(name, _)| name.clone()).collect()
    }
}

pub fn int(args: &[NativeValue], index: usize) -> i32 {
    args.get(index).map_or(0, |v| v.as_i32().unwrap_or(v.as_f64() as i32))
}

pub fn ptr(args: &[NativeValue], index: usize) -> NativePtr {
    int(args, index) as NativePtr
}

/// Shutdown signal shared by every instance of one image.
#[derive(Default)]
pub struct PoolSignal {
    shut_down: Mutex<bool>,
    cv: Condvar,
}

impl PoolSignal {
    fn wait(&self) {
        let Ok(guard) = self.shut_down.lock() else { return };
        let _ = self.cv.wait_timeout_while(guard, Duration::from_secs(5), |down| !*down);
    }

    fn signal(&self) {
        if let Ok(mut down) = self.shut_down.lock() {
            *down = true;
        }
        self.cv.notify_all();
    }
}

pub struct MockModule {
    state: Arc<Mutex<MockState>>,
    exports: Arc<HashMap<String, Handler>>,
    prefixes: Arc<Vec<String>>,
    allocator: AllocatorExports,
    pool: Arc<PoolSignal>,
}

impl NativeModule for MockModule {
    fn has_export(&self, export: &str) -> bool {
        let a = self.allocator;
        export == a.alloc
            || export == a.free
            || export == a.result_free
            || self.exports.contains_key(export)
            || self.prefixes.iter().any(|p| export.starts_with(p.as_str()))
    }

    fn call(&mut self, export: &str, args: &[NativeValue]) -> BridgeResult<Option<NativeValue>> {
        if !self.has_export(export) {
            return Err(BridgeError::unavailable(export));
        }
        if export == POOL_JOIN {
            if let Ok(mut state) = self.state.lock() {
                state.calls.push((export.to_string(), args.to_vec()));
            }
            self.pool.wait();
            return Ok(None);
        }

        let mut state = self.state.lock().map_err(|_| BridgeError::fault("mock state poisoned"))?;
        state.calls.push((export.to_string(), args.to_vec()));
        let a = self.allocator;
        if export == a.alloc {
            let p = state.alloc(int(args, 0) as usize);
            return Ok(Some(NativeValue::I32(p as i32)));
        }
        if export == a.free || export == a.result_free {
            state.release(ptr(args, 0));
            return Ok(None);
        }
        if export == "pngx_bridge_thread_pool_shutdown" {
            self.pool.signal();
        }
        match self.exports.get(export) {
            Some(handler) => handler(&mut *state, args),
            None => Ok(None),
        }
    }

    fn read(&self, p: NativePtr, len: usize) -> BridgeResult<Vec<u8>> {
        let state = self.state.lock().map_err(|_| BridgeError::fault("mock state poisoned"))?;
        state.read(p, len)
    }

    fn write(&mut self, p: NativePtr, bytes: &[u8]) -> BridgeResult<()> {
        let mut state = self.state.lock().map_err(|_| BridgeError::fault("mock state poisoned"))?;
        state.write(p, bytes)
    }

    fn allocator(&self) -> AllocatorExports {
        self.allocator
    }
}

/// A mock module image; every instance shares its state.
pub struct MockImage {
    name: String,
    state: Arc<Mutex<MockState>>,
    exports: Arc<HashMap<String, Handler>>,
    prefixes: Arc<Vec<String>>,
    allocator: AllocatorExports,
    pool: Arc<PoolSignal>,
    instance_limit: Option<usize>,
    instances: AtomicUsize,
}

impl MockImage {
    pub fn state(&self) -> Arc<Mutex<MockState>> {
        Arc::clone(&self.state)
    }

    pub fn instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }

    /// A standalone instance for driving the bridge directly.
    pub fn module(&self) -> MockModule {
        MockModule {
            state: Arc::clone(&self.state),
            exports: Arc::clone(&self.exports),
            prefixes: Arc::clone(&self.prefixes),
            allocator: self.allocator,
            pool: Arc::clone(&self.pool),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }
}

impl ModuleImage for MockImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn instantiate(&self) -> BridgeResult<Box<dyn NativeModule>> {
        let count = self.instances.fetch_add(1, Ordering::SeqCst);
        if self.instance_limit.is_some_and(|limit| count >= limit) {
            return Err(BridgeError::initialization(format!("{} refused another instance", self.name)));
        }
        Ok(Box::new(self.module()))
    }
}

pub struct MockBuilder {
    name: String,
    exports: HashMap<String, Handler>,
    prefixes: Vec<String>,
    allocator: AllocatorExports,
    instance_limit: Option<usize>,
}

impl MockBuilder {
    pub fn new(name: &str, allocator: AllocatorExports) -> Self {
        Self {
            name: name.to_string(),
            exports: HashMap::new(),
            prefixes: Vec::new(),
            allocator,
            instance_limit: None,
        }
    }

    pub fn export<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut MockState, &[NativeValue]) -> BridgeResult<Option<NativeValue>> + Send + Sync + 'static,
    {
        self.exports.insert(name.to_string(), Arc::new(handler));
        self
    }

    pub fn constant(self, name: &str, value: i32) -> Self {
        self.export(name, move |_, _| Ok(Some(NativeValue::I32(value))))
    }

    pub fn without(mut self, name: &str) -> Self {
        self.exports.remove(name);
        self
    }

    /// Accepts any export with this prefix as a no-op.
    pub fn accept_prefix(mut self, prefix: &str) -> Self {
        self.prefixes.push(prefix.to_string());
        self
    }

    pub fn instance_limit(mut self, limit: usize) -> Self {
        self.instance_limit = Some(limit);
        self
    }

    pub fn build(self) -> Arc<MockImage> {
        Arc::new(MockImage {
            name: self.name,
            state: Arc::new(Mutex::new(MockState::default())),
            exports: Arc::new(self.exports),
            prefixes: Arc::new(self.prefixes),
            allocator: self.allocator,
            pool: Arc::new(PoolSignal::default()),
            instance_limit: self.instance_limit,
            instances: AtomicUsize::new(0),
        })
    }
}

/// What a scripted encoder does with one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encode {
    Output(usize),
    Fail { code: i32, aux: i32, attempted: i32 },
}

fn encoder<F>(behaviour: F) -> impl Fn(&mut MockState, &[NativeValue]) -> BridgeResult<Option<NativeValue>> + Send + Sync + 'static
where
    F: Fn(usize) -> Encode + Send + Sync + 'static,
{
    move |state: &mut MockState, args: &[NativeValue]| {
        let input_len = int(args, 1) as usize;
        let size_ptr = ptr(args, 3);
        match behaviour(input_len) {
            Encode::Output(len) => {
                let out = state.alloc_filled(len, 0xAB);
                state.write_u32(size_ptr, len as u32)?;
                state.last_error = 0;
                Ok(Some(NativeValue::I32(out as i32)))
            }
            Encode::Fail { code, aux, attempted } => {
                state.write_u32(size_ptr, attempted as u32)?;
                state.last_error = code;
                state.aux_error = aux;
                Ok(Some(NativeValue::I32(0)))
            }
        }
    }
}

/// Primary codec with config, error registers and versions; no encoders yet.
pub fn primary() -> MockBuilder {
    MockBuilder::new("mock-codec", AllocatorExports::PRIMARY)
        .export("emscripten_config_create", |state, _| {
            let p = state.alloc(64);
            Ok(Some(NativeValue::I32(p as i32)))
        })
        .export("emscripten_config_free", |state, args| {
            state.release(ptr(args, 0));
            Ok(None)
        })
        .accept_prefix("emscripten_config_webp_")
        .accept_prefix("emscripten_config_avif_")
        .accept_prefix("emscripten_config_pngx_")
        .export("emscripten_get_last_error", |state, _| Ok(Some(NativeValue::I32(state.last_error))))
        .export("emscripten_get_last_webp_error", |state, _| Ok(Some(NativeValue::I32(state.aux_error))))
        .export("emscripten_get_last_avif_error", |state, _| Ok(Some(NativeValue::I32(state.aux_error))))
        .export("emscripten_get_error_string", |state, _| {
            // Static string; never freed by the caller.
            let message = b"Encoding failed\0";
            let p = state.alloc(message.len());
            state.live.remove(&p);
            state.allocations -= 1;
            state.write(p, message)?;
            Ok(Some(NativeValue::I32(p as i32)))
        })
        .constant("emscripten_get_version", 1_006_002)
        .constant("emscripten_get_libwebp_version", 0x010500)
        .constant("emscripten_get_buildtime", (2025 << 20) | (3 << 16) | (14 << 11))
}

pub fn with_webp<F>(builder: MockBuilder, behaviour: F) -> MockBuilder
where
    F: Fn(usize) -> Encode + Send + Sync + 'static,
{
    builder.export("emscripten_convert_png_to_webp", encoder(behaviour))
}

pub fn with_avif<F>(builder: MockBuilder, behaviour: F) -> MockBuilder
where
    F: Fn(usize) -> Encode + Send + Sync + 'static,
{
    builder.export("emscripten_convert_png_to_avif", encoder(behaviour))
}

pub fn with_pngx<F>(builder: MockBuilder, behaviour: F) -> MockBuilder
where
    F: Fn(usize) -> Encode + Send + Sync + 'static,
{
    builder.export("emscripten_convert_png_to_pngx", encoder(behaviour))
}

/// Palette session exports. `prepare` yields a `width`x`height` image with
/// the given quality floor; `finalize` produces `finalized_len` bytes.
pub fn with_palette(builder: MockBuilder, width: u32, height: u32, quality_min: u8, finalized_len: usize) -> MockBuilder {
    builder
        .export("emscripten_pngx_palette256_prepare", move |state, args| {
            let rgba_len = (width * height * 4) as usize;
            let rgba = state.alloc_filled(rgba_len, 0x7F);
            state.session.push(rgba);
            let slot = |i: usize| ptr(args, 3 + i);
            state.write_u32(slot(0), rgba)?;
            state.write_u32(slot(1), width)?;
            state.write_u32(slot(2), height)?;
            state.write_u32(slot(5), 3)?;
            state.write(slot(6), &[quality_min])?;
            state.write(slot(7), &[90])?;
            state.write_u32(slot(8), 256)?;
            state.write_u32(slot(9), 0.6f32.to_bits())?;
            Ok(Some(NativeValue::I32(1)))
        })
        .export("emscripten_pngx_palette256_finalize", move |state, args| {
            let size_ptr = ptr(args, 4);
            let out = state.alloc_filled(finalized_len, 0x50);
            state.write_u32(size_ptr, finalized_len as u32)?;
            Ok(Some(NativeValue::I32(out as i32)))
        })
        .export("emscripten_pngx_palette256_cleanup", |state, _| {
            let session = std::mem::take(&mut state.session);
            for p in session {
                state.release(p);
            }
            Ok(None)
        })
}

/// Quantization module. `statuses` are returned by successive quantize
/// calls (then 0); `lossless` maps an input length to the optimized length.
pub fn quant<L>(statuses: Vec<i32>, lossless: L) -> MockBuilder
where
    L: Fn(usize) -> usize + Send + Sync + 'static,
{
    let statuses = Arc::new(Mutex::new(VecDeque::from(statuses)));
    let quantize = move |state: &mut MockState, args: &[NativeValue]| -> BridgeResult<Option<NativeValue>> {
        let status = statuses.lock().unwrap().pop_front().unwrap_or(0);
        let pixels = (int(args, 1) / 4) as usize;
        let handle = state.alloc(16);
        let (palette, indices) = if status == 0 {
            (state.alloc_filled(16 * 4, 0x10), state.alloc_filled(pixels, 0x01))
        } else {
            (0, 0)
        };
        let palette_len = if status == 0 { 16 * 4 } else { 0 };
        let indices_len = if status == 0 { pixels } else { 0 };
        state.quant_results.insert(handle, (status, 80, palette, palette_len, indices, indices_len));
        Ok(Some(NativeValue::I32(handle as i32)))
    };
    let quantize = Arc::new(quantize);
    let advanced = Arc::clone(&quantize);

    fn field(state: &MockState, args: &[NativeValue], pick: fn(&(i32, i32, NativePtr, usize, NativePtr, usize)) -> i32) -> BridgeResult<Option<NativeValue>> {
        let result = state
            .quant_results
            .get(&ptr(args, 0))
            .ok_or_else(|| BridgeError::fault("unknown quantization handle"))?;
        Ok(Some(NativeValue::I32(pick(result))))
    }

    MockBuilder::new("mock-quant", AllocatorExports::QUANT)
        .export("pngx_bridge_optimize_lossless", move |state, args| {
            let input_len = int(args, 1) as usize;
            let size_ptr = ptr(args, 5);
            let len = lossless(input_len);
            let out = state.alloc_filled(len, 0x33);
            state.write_u32(size_ptr, len as u32)?;
            Ok(Some(NativeValue::I32(out as i32)))
        })
        .export("pngx_bridge_quantize", move |state, args| (*quantize)(state, args))
        .export("pngx_bridge_quantize_advanced", move |state, args| (*advanced)(state, args))
        .export("pngx_bridge_quant_result_status", |state, args| field(state, args, |r| r.0))
        .export("pngx_bridge_quant_result_quality", |state, args| field(state, args, |r| r.1))
        .export("pngx_bridge_quant_result_palette_ptr", |state, args| field(state, args, |r| r.2 as i32))
        .export("pngx_bridge_quant_result_palette_len", |state, args| field(state, args, |r| r.3 as i32))
        .export("pngx_bridge_quant_result_indices_ptr", |state, args| field(state, args, |r| r.4 as i32))
        .export("pngx_bridge_quant_result_indices_len", |state, args| field(state, args, |r| r.5 as i32))
        .export("pngx_bridge_quant_result_free", |state, args| {
            let handle = ptr(args, 0);
            if let Some((_, _, palette, _, indices, _)) = state.quant_results.remove(&handle) {
                state.release(palette);
                state.release(indices);
            }
            state.release(handle);
            Ok(None)
        })
        .constant("pngx_bridge_oxipng_version", 90_100)
        .constant("pngx_bridge_libimagequant_version", 40_002)
}

/// Adds the thread-pool exports and reports threads as enabled.
pub fn threaded(builder: MockBuilder) -> MockBuilder {
    builder
        .constant("pngx_bridge_is_threads_enabled", 1)
        .export("pngx_bridge_thread_pool_prepare", |state, _| {
            let p = state.alloc(8);
            Ok(Some(NativeValue::I32(p as i32)))
        })
        .export(POOL_JOIN, |_, _| Ok(None))
        .export("pngx_bridge_thread_pool_shutdown", |state, args| {
            state.release(ptr(args, 0));
            Ok(None)
        })
}

/// Resolves locations to registered mock images.
#[derive(Default)]
pub struct MockLoader {
    images: HashMap<String, Arc<MockImage>>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, location: &str, image: Arc<MockImage>) -> Self {
        self.images.insert(location.to_string(), image);
        self
    }

    fn get(&self, location: &str) -> BridgeResult<Arc<dyn ModuleImage>> {
        self.images
            .get(location)
            .map(|image| Arc::clone(image) as Arc<dyn ModuleImage>)
            .ok_or_else(|| BridgeError::initialization(format!("Failed to read module {location}")))
    }
}

impl ModuleLoader for MockLoader {
    fn load_primary(&self, location: &str) -> BridgeResult<Arc<dyn ModuleImage>> {
        self.get(location)
    }

    fn load_secondary(&self, location: &str) -> BridgeResult<Arc<dyn ModuleImage>> {
        self.get(location)
    }
}

/// PNG signature followed by `len - 8` filler bytes.
pub fn png_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
    bytes.resize(len.max(8), 0x42);
    bytes
}
