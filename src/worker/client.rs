//! Caller-side handle to a running orchestrator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use super::error::{WorkerError, WorkerResult};
use super::orchestrator::Orchestrator;
use super::protocol::{RequestId, WorkerRequest, WorkerResponse};
use crate::core::{InitInfo, OptionRecord, WorkerConfig};
use crate::processing::native::ModuleLoader;

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<WorkerResponse>>>>;

/// Issues requests and routes each response back to whoever sent the request.
///
/// Must be created inside a tokio runtime.
pub struct WorkerClient {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    pending: PendingMap,
    next_id: AtomicU64,
    terminated: Arc<AtomicBool>,
    orchestrator: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// A response that has not arrived yet.
pub struct PendingResponse {
    id: RequestId,
    receiver: oneshot::Receiver<WorkerResponse>,
}

impl PendingResponse {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub async fn wait(self) -> WorkerResult<WorkerResponse> {
        Ok(self.receiver.await?)
    }
}

impl WorkerClient {
    pub fn spawn(loader: Arc<dyn ModuleLoader>) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let terminated = Arc::new(AtomicBool::new(false));

        let orchestrator = tokio::spawn(Orchestrator::new(loader).run(request_rx, response_tx));
        let dispatcher = tokio::spawn(dispatch(response_rx, Arc::clone(&pending), Arc::clone(&terminated)));
        debug!("Worker spawned");

        Self {
            requests: request_tx,
            pending,
            next_id: AtomicU64::new(1),
            terminated,
            orchestrator,
            dispatcher,
        }
    }

    /// Sends a request built around a fresh id without waiting for the answer.
    pub fn submit(&self, build: impl FnOnce(RequestId) -> WorkerRequest) -> WorkerResult<PendingResponse> {
        if self.is_terminated() {
            return Err(WorkerError::Terminated);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = oneshot::channel();
        self.pending.lock()?.insert(id, tx);

        if let Err(e) = self.requests.send(build(id)) {
            self.pending.lock()?.remove(&id);
            return Err(e.into());
        }
        Ok(PendingResponse { id, receiver })
    }

    pub async fn request(&self, build: impl FnOnce(RequestId) -> WorkerRequest) -> WorkerResult<WorkerResponse> {
        self.submit(build)?.wait().await
    }

    pub async fn init(&self, config: WorkerConfig) -> WorkerResult<InitInfo> {
        match self.request(|id| WorkerRequest::init(id, config)).await? {
            WorkerResponse::InitComplete {
                threads_enabled,
                secondary_enabled,
                secondary_threads_enabled,
                versions,
                ..
            } => Ok(InitInfo { threads_enabled, secondary_enabled, secondary_threads_enabled, versions }),
            WorkerResponse::Error { error, .. } => Err(WorkerError::Initialization(error)),
            other => Err(unexpected(&other)),
        }
    }

    /// Converts `input`; the buffer is moved to the worker, not copied.
    pub async fn convert(&self, format_id: Option<&str>, options: OptionRecord, input: Vec<u8>) -> WorkerResult<Vec<u8>> {
        let format_id = format_id.map(str::to_string);
        let response = self
            .request(|id| WorkerRequest::Convert { id, format_id, options, input })
            .await?;
        into_output(response)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Stops the worker. Every outstanding and future request fails with
    /// [`WorkerError::Terminated`].
    ///
    /// A conversion already running natively finishes in the background and
    /// its result is discarded.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.orchestrator.abort();
        self.dispatcher.abort();
        fail_pending(&self.pending);
        debug!("Worker terminated");
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Extracts the converted bytes from a convert response.
pub fn into_output(response: WorkerResponse) -> WorkerResult<Vec<u8>> {
    match response {
        WorkerResponse::ConvertResult { output, .. } => Ok(output),
        WorkerResponse::Error { error, error_code, input_size, output_size, .. } => Err(WorkerError::Conversion {
            message: error,
            code: error_code,
            input_size,
            output_size,
        }),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &WorkerResponse) -> WorkerError {
    WorkerError::StateError(format!("unexpected response to request {}", response.id()))
}

/// Dropping the senders wakes every waiter with `Terminated`.
fn fail_pending(pending: &PendingMap) {
    match pending.lock() {
        Ok(mut map) => map.clear(),
        Err(poisoned) => poisoned.into_inner().clear(),
    }
}

async fn dispatch(mut responses: mpsc::UnboundedReceiver<WorkerResponse>, pending: PendingMap, terminated: Arc<AtomicBool>) {
    while let Some(response) = responses.recv().await {
        let id = response.id();
        let waiter = match pending.lock() {
            Ok(mut map) => map.remove(&id),
            Err(_) => {
                warn!("Pending request table poisoned, dropping response {}", id);
                continue;
            }
        };
        match waiter {
            Some(waiter) => {
                // The caller may have stopped waiting.
                let _ = waiter.send(response);
            }
            None => warn!("No pending request for response {}", id),
        }
    }
    terminated.store(true, Ordering::SeqCst);
    fail_pending(&pending);
    debug!("Dispatcher stopped");
}
