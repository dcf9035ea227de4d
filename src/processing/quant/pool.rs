//! Worker threads backing the quantization module's internal parallelism.
//!
//! The module hands out a receiver; each pool thread instantiates the same
//! module image against the shared heap and parks inside `join(receiver)`,
//! where the module dispatches its parallel work.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, info, warn};
use crate::processing::native::{ModuleImage, NativeModule, NativePtr};
use crate::utils::{BridgeError, BridgeResult};

pub(crate) const PREPARE: &str = "pngx_bridge_thread_pool_prepare";
pub(crate) const JOIN: &str = "pngx_bridge_thread_pool_join";
pub(crate) const SHUTDOWN: &str = "pngx_bridge_thread_pool_shutdown";

const MAX_THREADS: usize = 64;
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Running pool threads and the receiver they serve.
pub struct ThreadPool {
    receiver: NativePtr,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Picks the pool size: the caller's count when positive, else the
    /// machine's parallelism, never more than 64.
    pub fn resolve_size(requested: Option<usize>) -> usize {
        let size = match requested {
            Some(n) if n > 0 => n,
            _ => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        };
        size.min(MAX_THREADS)
    }

    /// Starts the pool, returning only once every thread reported ready.
    ///
    /// On failure the receiver is shut down again and the caller continues
    /// single-threaded.
    pub fn start(
        image: &Arc<dyn ModuleImage>,
        control: &mut dyn NativeModule,
        requested: Option<usize>,
    ) -> BridgeResult<Self> {
        for export in [PREPARE, JOIN, SHUTDOWN] {
            if !control.has_export(export) {
                return Err(BridgeError::unavailable(export));
            }
        }
        let size = Self::resolve_size(requested);
        let receiver = control.call_ptr(PREPARE, &[(size as u32).into()])?;
        if receiver == 0 {
            return Err(BridgeError::allocation("thread pool receiver"));
        }

        let mut pool = Self { receiver, workers: Vec::with_capacity(size) };
        match pool.spawn_workers(image, size) {
            Ok(()) => {
                info!("Quantization thread pool ready with {} threads", size);
                Ok(pool)
            }
            Err(e) => {
                pool.shutdown(control);
                Err(e)
            }
        }
    }

    fn spawn_workers(&mut self, image: &Arc<dyn ModuleImage>, size: usize) -> BridgeResult<()> {
        let (ready_tx, ready_rx) = bounded::<BridgeResult<()>>(size);
        let receiver = self.receiver;

        for index in 0..size {
            let image = Arc::clone(image);
            let ready_tx = ready_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("quant-worker-{index}"))
                .spawn(move || match image.instantiate() {
                    Ok(mut module) => {
                        let _ = ready_tx.send(Ok(()));
                        drop(ready_tx);
                        if let Err(e) = module.call(JOIN, &[receiver.into()]) {
                            warn!("Quantization worker {} stopped: {}", index, e);
                        }
                        debug!("Quantization worker {} exited", index);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })
                .map_err(|e| BridgeError::initialization(format!("Failed to spawn quantization worker: {e}")))?;
            self.workers.push(handle);
        }
        drop(ready_tx);

        let deadline = Instant::now() + READY_TIMEOUT;
        for _ in 0..size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match ready_rx.recv_timeout(remaining) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(BridgeError::initialization("Timed out waiting for quantization workers"));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BridgeError::initialization("Quantization worker exited during startup"));
                }
            }
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Tells the module to release the receiver; parked threads return from `join`.
    ///
    /// Threads are detached rather than joined so a module that never wakes
    /// them cannot hang the caller.
    pub fn shutdown(self, control: &mut dyn NativeModule) {
        if let Err(e) = control.call(SHUTDOWN, &[self.receiver.into()]) {
            warn!("Failed to shut down quantization thread pool: {}", e);
        }
        debug!("Quantization thread pool shut down ({} threads)", self.workers.len());
    }
}
