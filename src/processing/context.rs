//! Explicit codec context: the loaded modules and what they report.

use std::thread;
use tracing::{debug, info, warn};
use super::native::{ModuleLoader, NativeModule};
use super::quant::QuantBridge;
use crate::core::{InitInfo, VersionInfo, WorkerConfig};
use crate::utils::BridgeResult;

const THREADS_ENABLED: &str = "emscripten_is_threads_enabled";
const DEFAULT_THREAD_COUNT: &str = "emscripten_get_default_thread_count";
const MAX_THREAD_COUNT: &str = "emscripten_get_max_thread_count";
const PREWARM_THREAD_POOL: &str = "emscripten_prewarm_thread_pool";

/// Everything one worker needs to convert images.
///
/// Built once per worker and dropped with it; nothing here is global.
pub struct CodecContext {
    codec: Box<dyn NativeModule>,
    quant: Option<QuantBridge>,
    threads_enabled: bool,
    versions: VersionInfo,
}

impl CodecContext {
    /// Loads the primary module and, when configured, the quantization module.
    ///
    /// Blocking; a failure at any step leaves nothing behind.
    pub fn init(loader: &dyn ModuleLoader, config: &WorkerConfig) -> BridgeResult<Self> {
        let image = loader.load_primary(&config.module_location)?;
        let mut codec = image.instantiate()?;

        let threads_enabled = codec.query_flag(THREADS_ENABLED)?.unwrap_or(false);
        if threads_enabled {
            prewarm(codec.as_mut(), config.thread_count);
        }

        let quant = match &config.secondary_location {
            Some(location) => {
                let image = loader.load_secondary(location)?;
                Some(QuantBridge::load(image, config.thread_count)?)
            }
            None => None,
        };

        let mut versions = VersionInfo {
            version: codec.query_u32("emscripten_get_version")?,
            libwebp_version: codec.query_u32("emscripten_get_libwebp_version")?,
            libpng_version: codec.query_u32("emscripten_get_libpng_version")?,
            libavif_version: codec.query_u32("emscripten_get_libavif_version")?,
            pngx_oxipng_version: codec.query_u32("emscripten_get_pngx_oxipng_version")?,
            pngx_libimagequant_version: codec.query_u32("emscripten_get_pngx_libimagequant_version")?,
            buildtime: codec.query_u32("emscripten_get_buildtime")?,
        };
        if let Some(quant) = &quant {
            let reported = quant.versions();
            versions.pngx_oxipng_version = reported.oxipng.or(versions.pngx_oxipng_version);
            versions.pngx_libimagequant_version = reported.libimagequant.or(versions.pngx_libimagequant_version);
        }

        info!(
            "Codec context ready: {} (threads: {}, quantization module: {})",
            image.name(),
            threads_enabled,
            quant.is_some()
        );
        Ok(Self { codec, quant, threads_enabled, versions })
    }

    pub fn info(&self) -> InitInfo {
        InitInfo {
            threads_enabled: self.threads_enabled,
            secondary_enabled: self.quant.is_some(),
            secondary_threads_enabled: self.quant.as_ref().is_some_and(QuantBridge::threads_enabled),
            versions: self.versions.clone(),
        }
    }

    pub fn versions(&self) -> &VersionInfo {
        &self.versions
    }

    /// Both modules at once, for pipelines that alternate between them.
    pub(crate) fn parts(&mut self) -> (&mut dyn NativeModule, Option<&mut QuantBridge>) {
        (self.codec.as_mut(), self.quant.as_mut())
    }
}

/// Spins up the primary module's own worker threads ahead of the first conversion.
///
/// Query and prewarm failures are logged, never returned.
fn prewarm(codec: &mut dyn NativeModule, requested: Option<usize>) {
    if !codec.has_export(PREWARM_THREAD_POOL) {
        return;
    }
    let default = thread_count(codec, DEFAULT_THREAD_COUNT);
    let max = thread_count(codec, MAX_THREAD_COUNT);
    let mut count = requested
        .filter(|n| *n > 0)
        .or(default)
        .unwrap_or_else(|| thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
    if let Some(max) = max {
        count = count.min(max);
    }

    debug!("Prewarming codec thread pool with {} threads", count);
    if let Err(e) = codec.call(PREWARM_THREAD_POOL, &[(count as u32).into()]) {
        warn!("Codec thread pool prewarm failed: {}", e);
    }
}

/// A positive thread count reported by `export`, if any.
fn thread_count(codec: &mut dyn NativeModule, export: &str) -> Option<usize> {
    match codec.query_u32(export) {
        Ok(count) => count.map(|n| n as usize).filter(|n| *n > 0),
        Err(e) => {
            warn!("Failed to query {}: {}", export, e);
            None
        }
    }
}
